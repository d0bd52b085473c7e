//! Login authentication and per-database authorization
//!
//! Passwords are stored as a salted, iterated blake3 digest and compared in
//! constant time. Admin logins bypass grant checks entirely.

use crate::catalog::{Catalog, CatalogStore};
use std::fmt;
use tessera_common::{ConnectionDescriptor, Result, TesseraError};
use tracing::{debug, warn};

/// Rounds of re-hashing applied on top of the salted digest
pub const HASH_ITERATIONS: u32 = 10_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Salted, iterated password digest
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash {
    hash: [u8; HASH_LEN],
    salt: [u8; SALT_LEN],
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash").finish_non_exhaustive()
    }
}

impl PasswordHash {
    /// Hash `password` under a fresh random salt
    pub fn new(password: &str) -> Self {
        let salt = *uuid::Uuid::new_v4().as_bytes();
        Self {
            hash: derive(password, &salt),
            salt,
        }
    }

    /// Rebuild from stored hex columns; `None` if either is malformed
    pub fn from_hex(hash: &str, salt: &str) -> Option<Self> {
        let hash: [u8; HASH_LEN] = hex::decode(hash).ok()?.try_into().ok()?;
        let salt: [u8; SALT_LEN] = hex::decode(salt).ok()?.try_into().ok()?;
        Some(Self { hash, salt })
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn salt_hex(&self) -> String {
        hex::encode(self.salt)
    }

    pub fn verify(&self, password: &str) -> bool {
        constant_time_eq(&derive(password, &self.salt), &self.hash)
    }
}

fn derive(password: &str, salt: &[u8; SALT_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut digest = *hasher.finalize().as_bytes();
    for _ in 0..HASH_ITERATIONS {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&digest);
        hasher.update(salt);
        digest = *hasher.finalize().as_bytes();
    }
    digest
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Outcome of authentication and (optionally) authorization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResult {
    pub login: String,
    pub authenticated: bool,
    pub authorized: bool,
    pub is_admin: bool,
    pub granted_databases: Vec<String>,
    pub status_message: String,
}

impl AuthResult {
    fn rejected(login: &str, message: String) -> Self {
        Self {
            login: login.to_string(),
            status_message: message,
            ..Default::default()
        }
    }

    /// Whether this login may touch `database`
    pub fn can_use(&self, database: &str) -> bool {
        self.authenticated
            && (self.is_admin
                || self
                    .granted_databases
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(database)))
    }
}

/// Check `name`/`password` against the store and load the admin flag and
/// grant set. Blocks on the store and on the password digest.
fn check_credentials(store: &dyn CatalogStore, name: &str, password: &str) -> Result<AuthResult> {
    let Some(login) = store.get_login(name)? else {
        warn!(login = %name, "Authentication failed: unknown login");
        return Ok(AuthResult::rejected(name, format!("Login failed for user '{}'", name)));
    };

    if !login.password.verify(password) {
        warn!(login = %name, "Authentication failed: bad password");
        return Ok(AuthResult::rejected(name, format!("Login failed for user '{}'", name)));
    }

    let granted_databases = if login.is_admin {
        Vec::new()
    } else {
        store.grants_for(&login.name)?
    };

    debug!(login = %login.name, admin = login.is_admin, grants = granted_databases.len(), "Login authenticated");
    Ok(AuthResult {
        login: login.name,
        authenticated: true,
        authorized: false,
        is_admin: login.is_admin,
        granted_databases,
        status_message: String::new(),
    })
}

/// Verifies credentials against the catalog
#[derive(Clone)]
pub struct AuthService {
    catalog: Catalog,
}

impl AuthService {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Check `name`/`password` and load the admin flag and grant set
    pub async fn authenticate_login(&self, name: &str, password: &str) -> Result<AuthResult> {
        let (name, password) = (name.to_string(), password.to_string());
        self.catalog
            .run(move |store| check_credentials(store, &name, &password))
            .await
    }

    /// Decide whether an authenticated login may use `database`
    pub fn authorize_for_database(&self, auth: &AuthResult, database: &str) -> AuthResult {
        let mut result = auth.clone();
        if !auth.authenticated {
            result.authorized = false;
            return result;
        }
        result.authorized = auth.can_use(database);
        result.status_message = if result.authorized {
            String::new()
        } else {
            format!("Login '{}' is not authorized for database '{}'", auth.login, database)
        };
        result
    }

    /// Authenticate the descriptor's credentials, failing on rejection
    pub async fn authenticate(&self, descriptor: &ConnectionDescriptor) -> Result<AuthResult> {
        let auth = self
            .authenticate_login(&descriptor.user_id, &descriptor.password)
            .await?;
        if !auth.authenticated {
            return Err(TesseraError::AuthenticationFailed(auth.status_message));
        }
        Ok(auth)
    }

    /// Authenticate, then authorize for `database`
    pub async fn authorize(&self, descriptor: &ConnectionDescriptor, database: &str) -> Result<AuthResult> {
        let auth = self.authenticate(descriptor).await?;
        let auth = self.authorize_for_database(&auth, database);
        if !auth.authorized {
            warn!(login = %auth.login, database = %database, "Authorization denied");
            return Err(TesseraError::AuthorizationDenied(auth.status_message));
        }
        Ok(auth)
    }
}

/// Fail unless the login carries the admin flag
pub fn require_admin(auth: &AuthResult) -> Result<()> {
    if auth.is_admin {
        Ok(())
    } else {
        Err(TesseraError::AuthorizationDenied(format!(
            "Login '{}' requires the admin role for this command",
            auth.login
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatabaseRecord, LoginRecord, SqliteCatalog};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn service() -> (TempDir, Arc<SqliteCatalog>, AuthService) {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(SqliteCatalog::open(dir.path().join("catalog.sqlite")).unwrap());
        let auth = AuthService::new(Catalog::new(catalog.clone()));
        (dir, catalog, auth)
    }

    #[test]
    fn test_password_hash_salted() {
        let a = PasswordHash::new("secret");
        let b = PasswordHash::new("secret");
        assert_ne!(a.salt_hex(), b.salt_hex());
        assert_ne!(a.hash_hex(), b.hash_hex());
        assert!(a.verify("secret") && b.verify("secret"));
        assert!(!a.verify("Secret"));

        let back = PasswordHash::from_hex(&a.hash_hex(), &a.salt_hex()).unwrap();
        assert_eq!(back, a);
        assert!(PasswordHash::from_hex("zz", &a.salt_hex()).is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[tokio::test]
    async fn test_default_admin_authenticates() {
        let (_dir, _catalog, auth) = service();
        let result = auth.authenticate_login("admin", "").await.unwrap();
        assert!(result.authenticated);
        assert!(result.is_admin);
        assert!(auth.authorize_for_database(&result, "ANYTHING").authorized);
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let (_dir, _catalog, auth) = service();
        let result = auth.authenticate_login("admin", "wrong").await.unwrap();
        assert!(!result.authenticated);
        assert!(result.status_message.contains("admin"));

        let result = auth.authenticate_login("ghost", "").await.unwrap();
        assert!(!result.authenticated);
    }

    #[tokio::test]
    async fn test_grants_decide_authorization() {
        let (_dir, catalog, auth) = service();
        catalog.insert_login(&LoginRecord::new("bob", "pw", false)).unwrap();
        catalog.insert_database(&DatabaseRecord::new("TEST1", "/d/TEST1.db")).unwrap();
        catalog.insert_database(&DatabaseRecord::new("TEST2", "/d/TEST2.db")).unwrap();
        catalog.grant("bob", "TEST2").unwrap();

        let bob = auth.authenticate_login("bob", "pw").await.unwrap();
        assert!(!bob.is_admin);
        assert_eq!(bob.granted_databases, vec!["TEST2"]);

        let denied = auth.authorize_for_database(&bob, "TEST1");
        assert!(!denied.authorized);
        assert!(denied.status_message.contains("TEST1"));
        assert!(auth.authorize_for_database(&bob, "test2").authorized);
    }

    #[tokio::test]
    async fn test_descriptor_helpers() {
        let (_dir, _catalog, auth) = service();
        let descriptor = ConnectionDescriptor::new("TEST1", "localhost", 1549).with_credentials("admin", "bad");
        assert!(matches!(
            auth.authenticate(&descriptor).await,
            Err(TesseraError::AuthenticationFailed(_))
        ));

        let admin = auth.authenticate_login("admin", "").await.unwrap();
        assert!(require_admin(&admin).is_ok());
        assert!(require_admin(&AuthResult::default()).is_err());
    }
}
