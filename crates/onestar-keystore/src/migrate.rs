//! One-way, idempotent migration of keystore files, v1 → v4.
//!
//! Each step fires only when the file's `version` tag matches, so running
//! the chain over an already-current file is a no-op. Migration happens in
//! memory; the store persists the result and a backup snapshot of the prior
//! version.
//!
//! Historical shapes:
//!   v1 — single keypair, no history
//!   v2 — + retired keypairs, rotation history
//!   v3 — + device registry, sync history
//!   v4 — + biometric profile, vault settings, schema/algorithm labels

use serde_json::{Value, json};
use uuid::Uuid;

use onestar_core::error::{Result, VaultError};

use crate::model::{KEYSTORE_ALGORITHM, KEYSTORE_VERSION, SCHEMA_VERSION, VaultSettings};

/// Outcome of running the chain.
pub struct Migrated {
    pub value: Value,
    /// Version tag the file carried before migration, when any step ran.
    pub from_version: Option<String>,
}

fn version_of(value: &Value) -> Result<String> {
    value
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| VaultError::CorruptKeystore("missing version tag".into()))
}

/// Run every applicable migration step. Unknown tags newer than v4 are
/// refused rather than guessed at.
pub fn migrate_to_latest(mut value: Value) -> Result<Migrated> {
    let original = version_of(&value)?;

    match original.as_str() {
        "v1" | "v2" | "v3" | "v4" => {}
        other => return Err(VaultError::UnsupportedVersion(other.to_string())),
    }

    if original == KEYSTORE_VERSION {
        return Ok(Migrated {
            value,
            from_version: None,
        });
    }

    loop {
        let version = version_of(&value)?;
        match version.as_str() {
            "v1" => migrate_v1_to_v2(&mut value)?,
            "v2" => migrate_v2_to_v3(&mut value)?,
            "v3" => migrate_v3_to_v4(&mut value)?,
            _ => break,
        }
    }

    tracing::info!(from = %original, to = KEYSTORE_VERSION, "keystore migrated");
    Ok(Migrated {
        value,
        from_version: Some(original),
    })
}

fn object_mut<'a>(value: &'a mut Value) -> Result<&'a mut serde_json::Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| VaultError::CorruptKeystore("keystore root is not an object".into()))
}

/// v1 → v2: retired-keypair list and rotation history appear. The single
/// v1 keypair gains a synthetic `"initial"` history entry so the chain has
/// a root.
fn migrate_v1_to_v2(value: &mut Value) -> Result<()> {
    let obj = object_mut(value)?;

    let key_id = obj
        .get("current_keypair")
        .and_then(|k| k.get("key_id"))
        .cloned()
        .ok_or_else(|| VaultError::CorruptKeystore("v1 keystore without current keypair".into()))?;
    let created_at = obj
        .get("current_keypair")
        .and_then(|k| k.get("created_at"))
        .cloned()
        .unwrap_or_else(|| json!(chrono::Utc::now()));

    obj.insert("previous_keypairs".into(), json!([]));
    obj.insert(
        "rotation_history".into(),
        json!([{
            "rotation_id": Uuid::now_v7(),
            "timestamp": created_at,
            "old_key_id": key_id,
            "new_key_id": key_id,
            "reason": "initial",
            "media_rewrapped": 0,
            "duration_ms": 0,
            "triggered_by": "manual",
            "device_id": Uuid::nil(),
        }]),
    );
    obj.insert("version".into(), json!("v2"));
    Ok(())
}

/// v2 → v3: the device registry appears. The device identity is minted
/// here; rotation entries recorded before devices existed keep the nil id.
fn migrate_v2_to_v3(value: &mut Value) -> Result<()> {
    let obj = object_mut(value)?;

    obj.insert("device_id".into(), json!(Uuid::now_v7()));
    obj.insert("device_name".into(), json!("migrated-device"));
    obj.insert(
        "device_created_at".into(),
        obj.get("created_at")
            .cloned()
            .unwrap_or_else(|| json!(chrono::Utc::now())),
    );
    obj.insert("last_synced_at".into(), Value::Null);
    obj.insert("sync_history".into(), json!([]));
    obj.insert("version".into(), json!("v3"));
    Ok(())
}

/// v3 → v4: biometric profile slot, vault settings, schema/algorithm
/// labels. Sealed keypair records gain their own salt and iteration count;
/// files written before that carried them only at keystore level.
fn migrate_v3_to_v4(value: &mut Value) -> Result<()> {
    let obj = object_mut(value)?;

    let salt = obj.get("password_salt").cloned().unwrap_or(Value::Null);
    let iterations = obj.get("pbkdf2_iterations").cloned().unwrap_or(Value::Null);

    let stamp = |record: &mut Value, salt: &Value, iterations: &Value| {
        if let Some(map) = record.as_object_mut() {
            map.entry("salt").or_insert_with(|| salt.clone());
            map.entry("iterations").or_insert_with(|| iterations.clone());
        }
    };
    if let Some(current) = obj.get_mut("current_keypair") {
        stamp(current, &salt, &iterations);
    }
    if let Some(previous) = obj.get_mut("previous_keypairs").and_then(Value::as_array_mut) {
        for record in previous {
            stamp(record, &salt, &iterations);
        }
    }

    obj.insert("biometric_profile".into(), Value::Null);
    obj.insert(
        "vault_settings".into(),
        serde_json::to_value(VaultSettings::default())?,
    );
    obj.insert("algorithm".into(), json!(KEYSTORE_ALGORITHM));
    obj.insert("schema_version".into(), json!(SCHEMA_VERSION));
    obj.insert("version".into(), json!(KEYSTORE_VERSION));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn v1_fixture() -> Value {
        json!({
            "version": "v1",
            "user_id": Uuid::now_v7(),
            "pbkdf2_iterations": 600_000,
            "password_salt": STANDARD.encode([0u8; 32]),
            "current_keypair": {
                "encrypted_keypair": STANDARD.encode([1u8; 48]),
                "iv": STANDARD.encode([2u8; 12]),
                "auth_tag": STANDARD.encode([3u8; 16]),
                "public": {
                    "kem_public": STANDARD.encode([4u8; 1184]),
                    "ecdh_public": STANDARD.encode([5u8; 32]),
                },
                "key_id": Uuid::now_v7(),
                "created_at": "2024-03-01T10:00:00Z",
            },
            "created_at": "2024-03-01T10:00:00Z",
            "last_modified": "2024-03-01T10:00:00Z",
        })
    }

    #[test]
    fn v1_chains_to_v4() {
        let migrated = migrate_to_latest(v1_fixture()).unwrap();
        assert_eq!(migrated.from_version.as_deref(), Some("v1"));

        let v = &migrated.value;
        assert_eq!(v["version"], "v4");
        assert_eq!(v["schema_version"], 4);
        assert_eq!(v["algorithm"], KEYSTORE_ALGORITHM);
        assert!(v["previous_keypairs"].as_array().unwrap().is_empty());
        assert_eq!(v["rotation_history"].as_array().unwrap().len(), 1);
        assert_eq!(v["rotation_history"][0]["reason"], "initial");
        assert_eq!(
            v["rotation_history"][0]["old_key_id"],
            v["rotation_history"][0]["new_key_id"]
        );
        assert!(v["sync_history"].as_array().unwrap().is_empty());
        assert!(v["biometric_profile"].is_null());
        assert_eq!(v["vault_settings"]["idle_timeout_ms"], 300_000);
        // Sealed records inherit the keystore-level KDF parameters.
        assert_eq!(v["current_keypair"]["salt"], v["password_salt"]);
        assert_eq!(v["current_keypair"]["iterations"], 600_000);
    }

    #[test]
    fn v4_is_a_noop() {
        let migrated = migrate_to_latest(v1_fixture()).unwrap();
        let again = migrate_to_latest(migrated.value.clone()).unwrap();
        assert!(again.from_version.is_none());
        assert_eq!(again.value, migrated.value);
    }

    #[test]
    fn newer_version_refused() {
        let mut v = v1_fixture();
        v["version"] = json!("v9");
        assert!(matches!(
            migrate_to_latest(v),
            Err(VaultError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn missing_version_is_corrupt() {
        let v = json!({"user_id": "nope"});
        assert!(matches!(
            migrate_to_latest(v),
            Err(VaultError::CorruptKeystore(_))
        ));
    }
}
