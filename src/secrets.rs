//! Secret material generation and policy enforcement
//!
//! The secret engine is the only component that generates plaintext
//! credential material. Generated values live in memory just long enough to
//! be written to the secret store; only version identifiers are ever
//! recorded in the resolved-attributes table or logs.

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Raised when supplied or generated material does not meet the target policy
#[derive(Debug, Error)]
#[error("secret material violates policy {policy}: {reason}")]
pub struct PolicyViolation {
    pub policy: String,
    pub reason: String,
}

/// Character-class and length policy for one class of secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPolicy {
    /// Database password: mixed case, digits, and symbols
    DatabasePassword,
    /// Application encryption key: long alphanumeric, no symbols
    EncryptionKey,
}

const PASSWORD_LEN: usize = 24;
const PASSWORD_SYMBOLS: &[u8] = b"-_#!@%^";
const KEY_LEN: usize = 48;

impl SecretPolicy {
    /// Parse the policy name used in descriptor configs
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "database-password" => Some(SecretPolicy::DatabasePassword),
            "encryption-key" => Some(SecretPolicy::EncryptionKey),
            _ => None,
        }
    }

    /// Policy name as written in descriptor configs
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretPolicy::DatabasePassword => "database-password",
            SecretPolicy::EncryptionKey => "encryption-key",
        }
    }

    /// Check externally supplied material against this policy.
    pub fn check(&self, material: &str) -> Result<(), PolicyViolation> {
        let fail = |reason: &str| PolicyViolation {
            policy: self.as_str().to_string(),
            reason: reason.to_string(),
        };

        match self {
            SecretPolicy::DatabasePassword => {
                if material.len() < PASSWORD_LEN {
                    return Err(fail(&format!("shorter than {PASSWORD_LEN} characters")));
                }
                if !material.chars().any(|c| c.is_ascii_lowercase()) {
                    return Err(fail("missing a lowercase letter"));
                }
                if !material.chars().any(|c| c.is_ascii_uppercase()) {
                    return Err(fail("missing an uppercase letter"));
                }
                if !material.chars().any(|c| c.is_ascii_digit()) {
                    return Err(fail("missing a digit"));
                }
                if !material.bytes().any(|b| PASSWORD_SYMBOLS.contains(&b)) {
                    return Err(fail("missing a symbol"));
                }
            }
            SecretPolicy::EncryptionKey => {
                if material.len() < KEY_LEN {
                    return Err(fail(&format!("shorter than {KEY_LEN} characters")));
                }
                if !material.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(fail("contains non-alphanumeric characters"));
                }
            }
        }
        Ok(())
    }

    /// Generate fresh random material satisfying this policy.
    pub fn generate(&self) -> SecretMaterial {
        let mut rng = rand::thread_rng();
        let value = match self {
            SecretPolicy::DatabasePassword => {
                // One draw from each required class, the rest from the union,
                // then shuffled so class positions are not predictable.
                let lower = b"abcdefghijklmnopqrstuvwxyz";
                let upper = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
                let digits = b"0123456789";
                let mut pool: Vec<u8> = Vec::new();
                pool.extend_from_slice(lower);
                pool.extend_from_slice(upper);
                pool.extend_from_slice(digits);
                pool.extend_from_slice(PASSWORD_SYMBOLS);

                let mut bytes = vec![
                    *lower.choose(&mut rng).expect("nonempty"),
                    *upper.choose(&mut rng).expect("nonempty"),
                    *digits.choose(&mut rng).expect("nonempty"),
                    *PASSWORD_SYMBOLS.choose(&mut rng).expect("nonempty"),
                ];
                while bytes.len() < PASSWORD_LEN {
                    bytes.push(*pool.choose(&mut rng).expect("nonempty"));
                }
                bytes.shuffle(&mut rng);
                String::from_utf8(bytes).expect("ascii")
            }
            SecretPolicy::EncryptionKey => (0..KEY_LEN)
                .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                .collect(),
        };
        SecretMaterial { value }
    }
}

impl std::fmt::Display for SecretPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext secret value.
///
/// Deliberately opaque: no `Display`, and `Debug` is redacted so material
/// cannot leak through error chains or structured logs.
#[derive(Clone)]
pub struct SecretMaterial {
    value: String,
}

impl SecretMaterial {
    /// Wrap externally supplied material after validating it against
    /// `policy`.
    pub fn supplied(value: impl Into<String>, policy: SecretPolicy) -> Result<Self, PolicyViolation> {
        let value = value.into();
        policy.check(&value)?;
        Ok(Self { value })
    }

    /// Wrap material read back from the secret store (already subject to
    /// policy when it was written).
    pub(crate) fn from_store(value: String) -> Self {
        Self { value }
    }

    /// Expose the plaintext. Callers are the secret store write path only.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretMaterial(<redacted>)")
    }
}

/// Owns secret material for one apply run.
///
/// Material is either supplied by the operator (validated up front, before
/// any mutation) or generated on demand when a secret version is about to be
/// created. Nothing outside the provider's store-write path reads plaintext.
#[derive(Debug, Default)]
pub struct SecretEngine {
    supplied: std::collections::HashMap<String, SecretMaterial>,
}

impl SecretEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register operator-supplied material for a secret-version descriptor.
    ///
    /// Fails pre-flight with [`PolicyViolation`] when the value does not meet
    /// the version's policy.
    pub fn supply(
        &mut self,
        descriptor_id: impl Into<String>,
        value: impl Into<String>,
        policy: SecretPolicy,
    ) -> Result<(), PolicyViolation> {
        let material = SecretMaterial::supplied(value, policy)?;
        self.supplied.insert(descriptor_id.into(), material);
        Ok(())
    }

    /// Material for a secret-version descriptor about to be created:
    /// supplied if the operator provided one, freshly generated otherwise.
    pub fn material_for(
        &self,
        descriptor_id: &str,
        policy_name: &str,
    ) -> Result<SecretMaterial, PolicyViolation> {
        let policy = SecretPolicy::parse(policy_name).ok_or_else(|| PolicyViolation {
            policy: policy_name.to_string(),
            reason: "not a known policy name".to_string(),
        })?;
        match self.supplied.get(descriptor_id) {
            Some(material) => Ok(material.clone()),
            None => Ok(policy.generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_satisfies_policy() {
        for _ in 0..100 {
            let material = SecretPolicy::DatabasePassword.generate();
            SecretPolicy::DatabasePassword
                .check(material.expose())
                .expect("generated password must satisfy its own policy");
        }
    }

    #[test]
    fn generated_key_satisfies_policy() {
        for _ in 0..100 {
            let material = SecretPolicy::EncryptionKey.generate();
            SecretPolicy::EncryptionKey
                .check(material.expose())
                .expect("generated key must satisfy its own policy");
        }
    }

    #[test]
    fn generation_is_not_repeatable() {
        let a = SecretPolicy::EncryptionKey.generate();
        let b = SecretPolicy::EncryptionKey.generate();
        assert_ne!(a.expose(), b.expose());

        let a = SecretPolicy::DatabasePassword.generate();
        let b = SecretPolicy::DatabasePassword.generate();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn supplied_material_must_meet_policy() {
        assert!(SecretMaterial::supplied("short", SecretPolicy::DatabasePassword).is_err());
        assert!(SecretMaterial::supplied(
            "alllowercasebutlongenough!!!!!!!",
            SecretPolicy::DatabasePassword
        )
        .is_err());
        assert!(SecretMaterial::supplied(
            "Va1id#Passw0rd-Material-Long",
            SecretPolicy::DatabasePassword
        )
        .is_ok());

        assert!(SecretMaterial::supplied(
            "has-symbols-so-not-a-valid-key-material-entry-000",
            SecretPolicy::EncryptionKey
        )
        .is_err());
        assert!(SecretMaterial::supplied(
            "0123456789abcdefghijABCDEFGHIJ0123456789abcdefgh",
            SecretPolicy::EncryptionKey
        )
        .is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        let material = SecretPolicy::EncryptionKey.generate();
        let debug = format!("{material:?}");
        assert!(!debug.contains(material.expose()));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn policy_names_roundtrip() {
        for policy in [SecretPolicy::DatabasePassword, SecretPolicy::EncryptionKey] {
            assert_eq!(SecretPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(SecretPolicy::parse("unknown"), None);
    }
}
