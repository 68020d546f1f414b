//! Stash Core Library
//!
//! Core functionality for Stash including:
//! - Content-addressed object store (blobs, trees, commits)
//! - Working repository: staging, commits, branches, checkout
//! - Tree diff and three-way merge
//! - Encrypted transport and the pkt-line sync protocol
//! - Sync server with htpasswd authentication
//! - Push, pull and clone client

pub mod auth;
pub mod client;
pub mod compression;
pub mod config;
pub mod diff;
pub mod error;
pub mod lock;
pub mod merge;
pub mod object;
pub mod packfile;
pub mod pktline;
pub mod printer;
pub mod protocol;
pub mod refs;
pub mod repository;
pub mod server;
pub mod storage;
pub mod store;
pub mod transport;

pub use auth::{AuthProvider, AuthResult, HtpasswdAuthProvider, StaticAuthProvider};
pub use client::{ObjectSource, PushReport, RemoteSession};
pub use config::{ClientOptions, Credentials, Fingerprint, Remote, RemoteConfig, ServerConfig};
pub use diff::{ChangeKind, DiffEntry, DiffLines};
pub use error::{Result, StashError};
pub use merge::MergeOutcome;
pub use object::{Commit, ObjectId, ObjectKind, Tree, TreeEntry};
pub use packfile::{PackReader, PackWriter, Prepfile};
pub use printer::{ConsolePrinter, Printer};
pub use repository::Repository;
pub use server::Server;
pub use storage::{FileSystem, RepositoryRegistry};
pub use store::ObjectStore;
pub use transport::CipherSuite;
