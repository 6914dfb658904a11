//! Serde helpers for binary fields carried as base64 in JSON formats.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// `#[serde(with = "encoding::b64")]` for `Vec<u8>` fields.
pub mod b64 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}

/// `#[serde(with = "encoding::b64_arr")]` for fixed-length `[u8; N]` fields.
/// Rejects payloads whose decoded length does not match.
pub mod b64_arr {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        let decoded = STANDARD.decode(&s).map_err(D::Error::custom)?;
        decoded
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, got {}", decoded.len())))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super::b64")]
        data: Vec<u8>,
        #[serde(with = "super::b64_arr")]
        iv: [u8; 12],
    }

    #[test]
    fn roundtrip() {
        let blob = Blob {
            data: vec![1, 2, 3, 255],
            iv: [7u8; 12],
        };
        let json = serde_json::to_string(&blob).unwrap();
        let back: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![1, 2, 3, 255]);
        assert_eq!(back.iv, [7u8; 12]);
    }

    #[test]
    fn wrong_length_rejected() {
        // 4 bytes where 12 are required
        let json = r#"{"data":"AQI=","iv":"AQIDBA=="}"#;
        assert!(serde_json::from_str::<Blob>(json).is_err());
    }
}
