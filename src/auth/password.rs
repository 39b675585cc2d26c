use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_hash_verifies_only_the_original_password() {
        let hash = hash_password("un-tres-bon-mot-de-passe").unwrap();
        assert!(verify_password("un-tres-bon-mot-de-passe", &hash).unwrap());
        assert!(!verify_password("un-tres-bon-mot-de-pass", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn hashing_the_same_password_twice_salts_differently() {
        let first = hash_password("shared secret").unwrap();
        let second = hash_password("shared secret").unwrap();
        assert_ne!(first, second);
        // Both still verify despite the differing salts.
        assert!(verify_password("shared secret", &first).unwrap());
        assert!(verify_password("shared secret", &second).unwrap());
    }

    #[test]
    fn malformed_stored_hash_is_an_error_not_a_mismatch() {
        assert!(verify_password("anything", "$argon2id$garbage").is_err());
    }
}
