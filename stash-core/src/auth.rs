//! Authentication providers for the sync server
//!
//! Credentials come from an Apache-style htpasswd file:
//! ```text
//! alice:$2y$05$rGZz6f3q9W5v7xY8zM2mLe8wW0k9vY6gQ4hMxLkNnMzKqPpJrWQ6e
//! bob:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=
//! ```
//! Supported hashes are bcrypt (`$2y$`, `$2b$`, `$2a$`, behind the
//! `bcrypt-auth` feature) and SHA-1 (`{SHA}`).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, StashError};

/// Authentication result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// Authentication successful with the username
    Success(String),
    /// Wrong password or unknown user
    Failed,
    /// The provider could not decide (unsupported hash, broken backend)
    Error(String),
}

/// Authentication provider trait
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult;
}

/// Htpasswd-based authentication provider
#[derive(Clone, Default)]
pub struct HtpasswdAuthProvider {
    users: HashMap<String, String>, // username -> password_hash
}

impl HtpasswdAuthProvider {
    /// Load users from an htpasswd file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            StashError::Config(format!("failed to read htpasswd file {:?}: {}", path.as_ref(), e))
        })?;
        Self::from_content(&content)
    }

    /// Parse htpasswd content. An empty file yields a provider that rejects
    /// everyone.
    pub fn from_content(content: &str) -> Result<Self> {
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (username, hash) = line
                .split_once(':')
                .map(|(u, h)| (u.trim(), h.trim()))
                .filter(|(u, h)| !u.is_empty() && !h.is_empty())
                .ok_or_else(|| StashError::Config(format!("invalid htpasswd line: {}", line)))?;
            users.insert(username.to_string(), hash.to_string());
        }
        Ok(Self { users })
    }

    pub fn contains_user(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Insert or replace a user's hash
    pub fn set_user(&mut self, username: &str, hash: String) -> Result<()> {
        validate_username(username)?;
        self.users.insert(username.to_string(), hash);
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut names: Vec<_> = self.users.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| format!("{}:{}\n", name, self.users[name]))
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, self.render())?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn verify_bcrypt(hash: &str, password: &str) -> std::result::Result<bool, String> {
        if !hash.starts_with("$2y$") && !hash.starts_with("$2b$") && !hash.starts_with("$2a$") {
            return Ok(false);
        }

        #[cfg(feature = "bcrypt-auth")]
        {
            bcrypt::verify(password, hash).map_err(|e| e.to_string())
        }

        #[cfg(not(feature = "bcrypt-auth"))]
        {
            let _ = password;
            Err("bcrypt verification requires the 'bcrypt-auth' feature".to_string())
        }
    }

    fn verify_sha1(hash: &str, password: &str) -> bool {
        match hash.strip_prefix("{SHA}") {
            Some(expected) => sha1_digest(password) == expected,
            None => false,
        }
    }

    fn verify_password(&self, username: &str, password: &str) -> std::result::Result<bool, String> {
        let Some(hash) = self.users.get(username) else {
            return Ok(false);
        };
        if hash.starts_with("$2") {
            return Self::verify_bcrypt(hash, password);
        }
        if hash.starts_with("{SHA}") {
            return Ok(Self::verify_sha1(hash, password));
        }
        Err(format!("unsupported password hash format for user: {}", username))
    }
}

#[async_trait]
impl AuthProvider for HtpasswdAuthProvider {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult {
        if username.is_empty() || password.is_empty() {
            return AuthResult::Failed;
        }

        match self.verify_password(username, password) {
            Ok(true) => AuthResult::Success(username.to_string()),
            Ok(false) => AuthResult::Failed,
            Err(e) => AuthResult::Error(e),
        }
    }
}

/// Fixed in-memory user list with plaintext passwords, for tests and
/// throwaway servers
#[derive(Clone, Default)]
pub struct StaticAuthProvider {
    users: HashMap<String, String>,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult {
        match self.users.get(username) {
            Some(expected) if !password.is_empty() && expected == password => {
                AuthResult::Success(username.to_string())
            }
            _ => AuthResult::Failed,
        }
    }
}

fn sha1_digest(password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// `{SHA}`-style htpasswd hash for `password`
pub fn sha1_hash(password: &str) -> String {
    format!("{{SHA}}{}", sha1_digest(password))
}

/// bcrypt htpasswd hash for `password`
#[cfg(feature = "bcrypt-auth")]
pub fn bcrypt_hash(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| StashError::Crypto(e.to_string()))
}

/// Usernames travel inside `@`-separated login payloads and `:`-separated
/// htpasswd lines
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty()
        || username.contains(['@', ':', '/', '\\'])
        || username.chars().any(char::is_whitespace)
    {
        return Err(StashError::InvalidArgument(format!("invalid username {:?}", username)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_htpasswd() {
        let content = r#"
            admin:$2y$05$rGZz6f3q9W5v7xY8zM2mLe8wW0k9vY6gQ4hMxLkNnMzKqPpJrWQ6e
            # comment
            user1:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=
        "#;

        let provider = HtpasswdAuthProvider::from_content(content).unwrap();
        assert!(provider.contains_user("admin"));
        assert!(provider.contains_user("user1"));
    }

    #[test]
    fn test_parse_htpasswd_invalid() {
        assert!(HtpasswdAuthProvider::from_content("invalid_line_without_colon").is_err());
        assert!(HtpasswdAuthProvider::from_content("user:").is_err());
    }

    #[test]
    fn test_sha1_hash_format() {
        assert_eq!(sha1_hash("password"), "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=");
    }

    #[tokio::test]
    async fn test_sha1_authentication() {
        let provider = HtpasswdAuthProvider::from_content(&format!("bob:{}\n", sha1_hash("secret"))).unwrap();
        assert_eq!(provider.authenticate("bob", "secret").await, AuthResult::Success("bob".into()));
        assert_eq!(provider.authenticate("bob", "wrong").await, AuthResult::Failed);
        assert_eq!(provider.authenticate("nobody", "secret").await, AuthResult::Failed);
        assert_eq!(provider.authenticate("bob", "").await, AuthResult::Failed);
    }

    #[cfg(feature = "bcrypt-auth")]
    #[tokio::test]
    async fn test_bcrypt_authentication() {
        let mut provider = HtpasswdAuthProvider::default();
        let hash = bcrypt::hash("pw", 4).unwrap();
        provider.set_user("carol", hash).unwrap();
        assert_eq!(provider.authenticate("carol", "pw").await, AuthResult::Success("carol".into()));
        assert_eq!(provider.authenticate("carol", "nope").await, AuthResult::Failed);
    }

    #[tokio::test]
    async fn test_unsupported_hash_is_an_error() {
        let provider = HtpasswdAuthProvider::from_content("dave:plaintext\n").unwrap();
        assert!(matches!(provider.authenticate("dave", "plaintext").await, AuthResult::Error(_)));
    }

    #[test]
    fn test_render_roundtrip() {
        let mut provider = HtpasswdAuthProvider::default();
        provider.set_user("b", sha1_hash("1")).unwrap();
        provider.set_user("a", sha1_hash("2")).unwrap();
        assert!(provider.set_user("bad@name", sha1_hash("3")).is_err());
        let text = provider.render();
        assert!(text.starts_with("a:{SHA}"));
        assert!(HtpasswdAuthProvider::from_content(&text).unwrap().contains_user("b"));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticAuthProvider::new().with_user("alice", "pw");
        assert_eq!(provider.authenticate("alice", "pw").await, AuthResult::Success("alice".into()));
        assert_eq!(provider.authenticate("alice", "x").await, AuthResult::Failed);
    }
}
