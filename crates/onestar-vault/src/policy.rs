//! Password policy, evaluated before any KDF work is spent.

use onestar_core::error::{Result, VaultError};

/// Character classes required (any two of lowercase/uppercase/digit/symbol).
const MIN_CLASSES: usize = 2;
/// Estimated-entropy floor in bits.
const MIN_ENTROPY_BITS: f64 = 60.0;

/// Passwords nobody should be allowed to vault media behind, including the
/// padded variants people reach for when a length rule blocks the short one.
const BLACKLIST: &[&str] = &[
    "password",
    "passwordpassword",
    "password12345678",
    "qwertyuiopasdfgh",
    "qwertyuiop123456",
    "1234567890123456",
    "0123456789012345",
    "abcdefghijklmnop",
    "iloveyouiloveyou",
    "adminadminadmin1",
    "letmeinletmein12",
    "trustno1trustno1",
    "sunshine12345678",
    "monkeymonkey1234",
    "dragondragon1234",
];

/// Estimated entropy: `length × log2(charset)`, charset summed over the
/// classes actually present. A crude Shannon-style bound, good enough to
/// reject structureless-looking short inputs.
pub fn estimate_entropy_bits(password: &str) -> f64 {
    let mut charset = 0usize;
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        charset += 26;
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        charset += 26;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        charset += 10;
    }
    if password
        .chars()
        .any(|c| !c.is_ascii_alphanumeric())
    {
        charset += 33;
    }
    if charset == 0 {
        return 0.0;
    }
    password.chars().count() as f64 * (charset as f64).log2()
}

fn class_count(password: &str) -> usize {
    let mut classes = 0;
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        classes += 1;
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        classes += 1;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        classes += 1;
    }
    if password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        classes += 1;
    }
    classes
}

/// Check a candidate vault password. Returns `WeakPassword` with the first
/// rule it breaks; never touches the KDF.
pub fn check_password(password: &str, min_length: usize) -> Result<()> {
    if password.chars().count() < min_length {
        return Err(VaultError::WeakPassword(format!(
            "shorter than {min_length} characters"
        )));
    }
    if BLACKLIST.contains(&password.to_lowercase().as_str()) {
        return Err(VaultError::WeakPassword("too common".into()));
    }
    if class_count(password) < MIN_CLASSES {
        return Err(VaultError::WeakPassword(
            "needs at least two character classes".into(),
        ));
    }
    let bits = estimate_entropy_bits(password);
    if bits < MIN_ENTROPY_BITS {
        return Err(VaultError::WeakPassword(format!(
            "estimated entropy {bits:.0} bits below {MIN_ENTROPY_BITS:.0}"
        )));
    }
    Ok(())
}
