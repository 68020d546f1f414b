//! Server and client configuration
//!
//! The server reads a TOML file; CLI flags override individual fields.
//! Clients keep their remotes in the repository's INI-style `.stash/config`:
//!
//! ```text
//! [remote "origin"]
//!     url = alice@project.stash
//!     address = 127.0.0.1:8838
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StashError};
use crate::transport::CipherSuite;

/// Port the server listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 8838;

/// Address used for remotes without an explicit `address` key
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8838";

/// Suffix accepted (and ignored) on repository names
pub const REPOSITORY_SUFFIX: &str = ".stash";

/// Sync server configuration, stored as TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind
    pub listen: String,
    /// Directory holding one subdirectory per repository
    pub storage_root: PathBuf,
    /// htpasswd file with user credentials
    pub users_file: PathBuf,
    /// JSON registry of repositories and their owners
    pub registry_file: PathBuf,
    /// Idle read timeout per connection, 0 disables it
    pub read_timeout_secs: u64,
    /// Packet cipher; clients must use the same one
    pub cipher: CipherSuite,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDRESS.to_string(),
            storage_root: PathBuf::from("stash-data"),
            users_file: PathBuf::from("stash-data/users.htpasswd"),
            registry_file: PathBuf::from("stash-data/registry.json"),
            read_timeout_secs: 120,
            cipher: CipherSuite::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| StashError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Ok(toml::from_str(&data)?)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

/// Remote repository identity: `username@repository[.stash]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub username: String,
    pub repository: String,
}

impl FromStr for Fingerprint {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StashError::Config(format!("invalid repository fingerprint {:?}", s));
        let (username, repository) = s.trim().split_once('@').ok_or_else(invalid)?;
        let repository = repository.strip_suffix(REPOSITORY_SUFFIX).unwrap_or(repository);
        if username.is_empty() || repository.is_empty() || repository.contains('@') {
            return Err(invalid());
        }
        Ok(Self {
            username: username.to_string(),
            repository: repository.to_string(),
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.username, self.repository, REPOSITORY_SUFFIX)
    }
}

/// A named remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub address: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            name: name.into(),
            fingerprint,
            address: DEFAULT_ADDRESS.to_string(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

/// Remotes of one local repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    remotes: Vec<Remote>,
}

impl RemoteConfig {
    /// Read remotes from an INI file; a missing file means no remotes
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut remotes = Vec::new();
        let mut current: Option<(String, Option<String>, Option<String>)> = None;

        let mut finish = |section: Option<(String, Option<String>, Option<String>)>| -> Result<()> {
            if let Some((name, url, address)) = section {
                let url = url.ok_or_else(|| StashError::Config(format!("remote '{}' has no url", name)))?;
                let mut remote = Remote::new(name, url.parse()?);
                if let Some(address) = address {
                    remote = remote.with_address(address);
                }
                remotes.push(remote);
            }
            Ok(())
        };

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                finish(current.take())?;
                let name = header
                    .trim()
                    .strip_prefix("remote")
                    .map(str::trim)
                    .and_then(|n| n.strip_prefix('"'))
                    .and_then(|n| n.strip_suffix('"'))
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| StashError::Config(format!("line {}: unknown section {:?}", lineno + 1, line)))?;
                current = Some((name.to_string(), None, None));
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| StashError::Config(format!("line {}: expected key = value", lineno + 1)))?;
            let section = current
                .as_mut()
                .ok_or_else(|| StashError::Config(format!("line {}: key outside a section", lineno + 1)))?;
            match key.trim() {
                "url" => section.1 = Some(value.trim().to_string()),
                "address" => section.2 = Some(value.trim().to_string()),
                other => tracing::debug!("ignoring config key {:?}", other),
            }
        }
        finish(current)?;
        Ok(Self { remotes })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for remote in &self.remotes {
            out.push_str(&format!("[remote \"{}\"]\n", remote.name));
            out.push_str(&format!("\turl = {}\n", remote.fingerprint));
            out.push_str(&format!("\taddress = {}\n", remote.address));
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, self.render())?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }

    pub fn remotes(&self) -> &[Remote] {
        &self.remotes
    }

    pub fn add(&mut self, remote: Remote) -> Result<()> {
        if self.get(&remote.name).is_some() {
            return Err(StashError::Config(format!("remote '{}' already exists", remote.name)));
        }
        self.remotes.push(remote);
        Ok(())
    }
}

/// Login credentials supplied by the caller
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a client session needs besides the remote itself
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub credentials: Credentials,
    pub read_timeout: Option<Duration>,
    pub cipher: CipherSuite,
}

impl ClientOptions {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            read_timeout: Some(Duration::from_secs(120)),
            cipher: CipherSuite::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: CipherSuite) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}
