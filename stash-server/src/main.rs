//! Stash Server - sync server for stash repositories
//!
//! Serves push, pull and clone over the encrypted stash protocol and
//! manages the storage root: users, repositories and pending changes.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stash_core::auth::{self, HtpasswdAuthProvider};
use stash_core::config::ServerConfig;
use stash_core::storage::{FileSystem, RepositoryRegistry};
use stash_core::{CipherSuite, Server};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "stash-server.toml";

/// Stash Server Configuration
#[derive(Parser, Debug)]
#[command(name = "stash-server")]
#[command(author = "Stash Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Sync server for stash repositories", long_about = None)]
struct Cli {
    /// Server configuration file (TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8838)
        #[arg(short, long)]
        addr: Option<String>,

        /// Directory holding the repositories
        #[arg(short, long)]
        storage_root: Option<PathBuf>,

        /// Packet cipher: legacy or aead
        #[arg(long)]
        cipher: Option<CipherSuite>,

        /// Idle read timeout in seconds, 0 disables it
        #[arg(long)]
        read_timeout: Option<u64>,
    },

    /// Initialize a storage root and write a default configuration
    Init {
        /// Directory holding the repositories
        #[arg(short, long, default_value = "stash-data")]
        storage_root: PathBuf,
    },

    /// Register a repository owned by a user
    CreateRepo {
        /// Repository name (without the .stash suffix)
        name: String,

        /// Owning user; only the owner moves branch heads directly
        #[arg(short, long)]
        owner: String,
    },

    /// Add or replace a user in the htpasswd file
    AddUser {
        username: String,

        #[arg(long, env = "STASH_PASSWORD", hide_env_values = true)]
        password: String,

        /// Store a {SHA} hash instead of bcrypt
        #[arg(long)]
        sha: bool,
    },

    /// List registered repositories
    Repos,

    /// Show a branch head and its root listing
    Show {
        /// Repository name
        name: String,

        #[arg(short, long, default_value = "main")]
        branch: String,
    },

    /// List changes pushed by non-owners
    Pending {
        /// Repository name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Start {
            addr,
            storage_root,
            cipher,
            read_timeout,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(addr) = addr {
                config.listen = addr;
            }
            if let Some(root) = storage_root {
                config.storage_root = root;
            }
            if let Some(cipher) = cipher {
                config.cipher = cipher;
            }
            if let Some(secs) = read_timeout {
                config.read_timeout_secs = secs;
            }

            info!("Starting stash server on {}", config.listen);
            info!("Storage root: {:?}", config.storage_root);
            info!("Packet cipher: {}", config.cipher);
            if config.cipher == CipherSuite::Legacy {
                tracing::warn!("legacy cipher in use: ECB mode without integrity protection");
            }

            let auth = HtpasswdAuthProvider::from_file(&config.users_file)?;
            let server = Server::from_config(&config, Arc::new(auth));
            let listener = TcpListener::bind(&config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            server.serve(listener).await?;
        }

        Commands::Init { storage_root } => {
            if cli.config.exists() {
                bail!("configuration {:?} already exists", cli.config);
            }
            std::fs::create_dir_all(&storage_root)?;
            let config = ServerConfig {
                users_file: storage_root.join("users.htpasswd"),
                registry_file: storage_root.join("registry.json"),
                storage_root,
                ..ServerConfig::default()
            };
            if !config.users_file.exists() {
                HtpasswdAuthProvider::default().save(&config.users_file)?;
            }
            if !config.registry_file.exists() {
                RepositoryRegistry::default().save(&config.registry_file)?;
            }
            std::fs::write(&cli.config, toml::to_string_pretty(&config)?)
                .with_context(|| format!("failed to write {:?}", cli.config))?;
            println!("Initialized storage root {:?}", config.storage_root);
            println!("Configuration written to {:?}", cli.config);
        }

        Commands::CreateRepo { name, owner } => {
            let config = load_config(&cli.config)?;
            let mut registry = RepositoryRegistry::load(&config.registry_file)?;
            let record = registry.register(&name, &owner)?;
            FileSystem::new(&config.storage_root).allocate_repository(&record.id)?;
            registry.save(&config.registry_file)?;
            println!("Created repository {} (owner: {}, id: {})", record.name, record.owner, record.id);
        }

        Commands::AddUser { username, password, sha } => {
            let config = load_config(&cli.config)?;
            let mut users = if config.users_file.exists() {
                HtpasswdAuthProvider::from_file(&config.users_file)?
            } else {
                HtpasswdAuthProvider::default()
            };
            let hash = if sha { auth::sha1_hash(&password) } else { auth::bcrypt_hash(&password)? };
            let existed = users.contains_user(&username);
            users.set_user(&username, hash)?;
            users.save(&config.users_file)?;
            println!("{} user {}", if existed { "Updated" } else { "Added" }, username);
        }

        Commands::Repos => {
            let config = load_config(&cli.config)?;
            let registry = RepositoryRegistry::load(&config.registry_file)?;
            for record in registry.repositories() {
                println!("{}\t{}\t{}", record.name, record.owner, record.id);
            }
        }

        Commands::Show { name, branch } => {
            let config = load_config(&cli.config)?;
            let (fs, id) = open_repository(&config, &name)?;
            let listing = fs.head_listing(&id, &branch)?;
            match listing.head {
                Some(head) => println!("{} {}", branch, head),
                None => println!("{} (no commits)", branch),
            }
            for entry in listing.files {
                println!("{} {} {}", entry.kind, entry.id, entry.path);
            }
            println!("branches: {}", fs.branches(&id)?.join(", "));
        }

        Commands::Pending { name } => {
            let config = load_config(&cli.config)?;
            let (fs, id) = open_repository(&config, &name)?;
            let changes = fs.pending_changes(&id)?;
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
    }

    Ok(())
}

/// Load the configuration file, falling back to defaults when the default
/// path does not exist
fn load_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(ServerConfig::default());
    }
    ServerConfig::load(path).with_context(|| format!("failed to load {:?}", path))
}

fn open_repository(config: &ServerConfig, name: &str) -> Result<(FileSystem, String)> {
    let registry = RepositoryRegistry::load(&config.registry_file)?;
    let record = registry
        .find_by_name(name)
        .with_context(|| format!("unknown repository '{}'", name))?;
    Ok((FileSystem::new(&config.storage_root), record.id.clone()))
}
