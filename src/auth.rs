use crate::model::UserId;
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    use argon2::password_hash::SaltString;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::{Argon2, PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Check staff credentials. Unknown email and wrong password are the same error.
pub async fn authenticate(store: &Store, email: &str, password: &str) -> Result<UserId, AuthError> {
    let Some(user) = store.find_user_by_email(email) else {
        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        return Err(AuthError::InvalidCredentials);
    };
    let password = password.to_string();
    let hash = user.password_hash.clone();
    // CPU-bound, runs on the blocking pool.
    let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    if ok {
        Ok(user.id)
    } else {
        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        Err(AuthError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("s3cret-pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret-pass", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("s3cret-pass", "not a phc string"));
    }

    #[tokio::test]
    async fn authenticate_staff() {
        let path = std::env::temp_dir().join("innkeep_test_auth.wal");
        let _ = std::fs::remove_file(&path);
        let store = Store::open(path, crate::limits::DEFAULT_STORE_TIMEOUT).unwrap();
        let user = store
            .create_user(
                "Ada".into(),
                "Admin".into(),
                "admin@admin.com".into(),
                hash_password("password").unwrap(),
                3,
            )
            .await
            .unwrap();

        assert_eq!(authenticate(&store, "admin@admin.com", "password").await.unwrap(), user.id);
        assert!(matches!(
            authenticate(&store, "admin@admin.com", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&store, "who@admin.com", "password").await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
