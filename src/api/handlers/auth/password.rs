use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

// Well-formed hash matching no account's password. The unknown-account
// path burns one full verification against it, its timing matches the
// known-account path.
const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$AAAAAAAAAAAAAAAAAAAAAA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Hash a password with Argon2id and a fresh random salt.
pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

pub(super) fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Verify against the stored hash, or against [`DUMMY_PASSWORD_HASH`] when
/// the account has none.
pub(super) fn verify_password_opaque(password: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            let _ = verify_password(password, DUMMY_PASSWORD_HASH);

            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        hash_password, verify_password, verify_password_opaque, DUMMY_PASSWORD_HASH,
    };
    use anyhow::Result;
    use argon2::password_hash::PasswordHash;

    #[test]
    fn test_hash_and_verify() -> Result<()> {
        let hash = hash_password("correct horse battery staple")?;

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("correct horse battery stable", &hash));

        Ok(())
    }

    #[test]
    fn test_hashes_are_salted() -> Result<()> {
        let first = hash_password("same password")?;
        let second = hash_password("same password")?;

        assert_ne!(first, second);

        Ok(())
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-phc-string"));
        assert!(!verify_password("anything", ""));
    }

    #[test]
    fn test_dummy_hash_parses() {
        assert!(PasswordHash::new(DUMMY_PASSWORD_HASH).is_ok());
    }

    #[test]
    fn test_verify_opaque() -> Result<()> {
        let hash = hash_password("swordfish")?;

        assert!(verify_password_opaque("swordfish", Some(&hash)));
        assert!(!verify_password_opaque("wrong", Some(&hash)));
        assert!(!verify_password_opaque("swordfish", None));

        Ok(())
    }
}
