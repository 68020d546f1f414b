//! Sync server
//!
//! One tokio task per accepted connection. A connection moves through
//! `AwaitLogin -> Serving`: the first command must be a login, every later
//! command gets handled against the repository and branch it named.
//! Filesystem work (ref updates, packfile execution) runs on the blocking
//! pool so the repository lock is never held across an await.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::auth::{AuthProvider, AuthResult};
use crate::config::ServerConfig;
use crate::error::{Result, StashError};
use crate::merge::can_fast_forward;
use crate::object::{ObjectId, optional_hex};
use crate::protocol::{BulkKind, Command, Connection, LoginRequest, StreamBuffer};
use crate::storage::{FileSystem, RepositoryRecord, RepositoryRegistry};
use crate::transport::{CipherSuite, SecureChannel};

/// Shared, read-only server state
struct ServerState {
    fs: FileSystem,
    registry_path: PathBuf,
    auth: Arc<dyn AuthProvider>,
    cipher: CipherSuite,
    read_timeout: Option<Duration>,
}

/// An authenticated connection's scope
#[derive(Debug, Clone)]
struct Session {
    user: String,
    repository: RepositoryRecord,
    branch: String,
}

impl Session {
    fn is_owner(&self) -> bool {
        self.user == self.repository.owner
    }
}

/// The sync server
#[derive(Clone)]
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(fs: FileSystem, registry_path: impl Into<PathBuf>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            state: Arc::new(ServerState {
                fs,
                registry_path: registry_path.into(),
                auth,
                cipher: CipherSuite::default(),
                read_timeout: None,
            }),
        }
    }

    pub fn from_config(config: &ServerConfig, auth: Arc<dyn AuthProvider>) -> Self {
        Self::new(FileSystem::new(&config.storage_root), &config.registry_file, auth)
            .with_cipher(config.cipher)
            .with_read_timeout(config.read_timeout())
    }

    pub fn with_cipher(mut self, cipher: CipherSuite) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.cipher = cipher;
        }
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.read_timeout = timeout;
        }
        self
    }

    /// Accept connections forever, one task each
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer.to_string()).await;
            });
        }
    }

    /// Drive one connection to completion, logging how it ended
    pub async fn handle_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tracing::info!("connection from {}", peer);
        match self.run(stream).await {
            Ok(()) => tracing::info!("connection from {} closed", peer),
            Err(e) => tracing::warn!("connection from {} ended: {}", peer, e),
        }
    }

    async fn run<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let channel = SecureChannel::establish(stream, self.state.cipher, self.state.read_timeout).await?;
        let mut conn = Connection::new(channel);

        let session = match self.login(&mut conn).await {
            Ok(session) => session,
            Err(e) => {
                let _ = conn.send(&Command::error(&e)).await;
                return Err(e);
            }
        };
        conn.send(&Command::Authorized).await?;
        tracing::info!(
            "{} authorized for {}@{}",
            session.user,
            session.repository.name,
            session.branch
        );
        self.serve_session(&mut conn, &session).await
    }

    async fn login<S>(&self, conn: &mut Connection<S>) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: LoginRequest = match conn.recv().await? {
            Command::Login(request) => request,
            other => return Err(StashError::Protocol(format!("expected login, got {}", other.name()))),
        };

        let user = match self.state.auth.authenticate(&request.username, &request.password).await {
            AuthResult::Success(user) => user,
            AuthResult::Failed => {
                tracing::warn!("rejected login for {}", request.username);
                return Err(StashError::AuthenticationFailed("invalid credentials".into()));
            }
            AuthResult::Error(e) => {
                tracing::warn!("authentication backend error for {}: {}", request.username, e);
                return Err(StashError::AuthenticationFailed("invalid credentials".into()));
            }
        };

        let registry_path = self.state.registry_path.clone();
        let name = request.repository.clone();
        let repository = blocking(&self.state.fs, move |_| {
            RepositoryRegistry::load(&registry_path)?
                .find_by_name(&name)
                .cloned()
                .ok_or_else(|| StashError::AuthenticationFailed(format!("unknown repository '{}'", name)))
        })
        .await?;

        let repo_id = repository.id.clone();
        let branch = request.branch.clone();
        blocking(&self.state.fs, move |fs| fs.ensure_branch(&repo_id, &branch)).await?;

        Ok(Session {
            user,
            repository,
            branch: request.branch,
        })
    }

    async fn serve_session<S>(&self, conn: &mut Connection<S>, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = StreamBuffer::default();
        // head of the session branch as last reported to this client
        let mut observed: Option<Option<ObjectId>> = None;
        loop {
            let command = match conn.recv().await {
                Ok(command) => command,
                Err(StashError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match command {
                Command::ReceiveObject(id) => {
                    let repo_id = session.repository.id.clone();
                    match blocking(&self.state.fs, move |fs| fs.read_object(&repo_id, &id)).await {
                        Ok(Some(data)) => conn.send_bulk(BulkKind::Object, data).await?,
                        Ok(None) => conn.send(&Command::SendObject(None)).await?,
                        Err(e) => conn.send(&Command::error(e)).await?,
                    }
                }
                Command::ReceiveHeadCommit(branch) => {
                    let repo_id = session.repository.id.clone();
                    let requested = branch.clone();
                    let reply = blocking(&self.state.fs, move |fs| fs.head(&repo_id, &requested)).await;
                    match reply {
                        Ok(tip) => {
                            if branch == session.branch {
                                observed = Some(tip);
                            }
                            conn.send(&Command::SendObject(Some(optional_hex(tip).into_bytes())))
                                .await?
                        }
                        Err(e) => {
                            conn.send(&Command::error(&e)).await?;
                            if e.is_connection_fatal() {
                                return Err(e);
                            }
                        }
                    }
                }
                Command::UpdateHead(tip) => {
                    let reply = match self.update_head(session, observed, tip).await {
                        Ok(()) => {
                            if session.is_owner() {
                                observed = Some(Some(tip));
                            }
                            Command::Ok
                        }
                        Err(e) => {
                            tracing::warn!("update of {} refused: {}", session.branch, e);
                            Command::error(e)
                        }
                    };
                    conn.send(&reply).await?;
                }
                Command::SendStream(chunk) => stream.push(&chunk)?,
                Command::SendPackfile(inline) => {
                    let reply = match self.receive_packfile(session, &mut stream, inline).await {
                        Ok(()) => Command::Ok,
                        Err(e) => {
                            tracing::error!("packfile for {} failed: {}", session.repository.name, e);
                            Command::error(e)
                        }
                    };
                    conn.send(&reply).await?;
                }
                other => {
                    let e = StashError::Protocol(format!("unexpected {} command", other.name()));
                    let _ = conn.send(&Command::error(&e)).await;
                    return Err(e);
                }
            }
        }
    }

    async fn receive_packfile(&self, session: &Session, stream: &mut StreamBuffer, inline: Vec<u8>) -> Result<()> {
        let data = stream.take()?.unwrap_or(inline);
        let repo_id = session.repository.id.clone();
        let stats = blocking(&self.state.fs, move |fs| fs.execute_packfile(&repo_id, &data)).await?;
        tracing::info!(
            "stored {} objects in {} ({} already present)",
            stats.written,
            session.repository.name,
            stats.skipped
        );
        Ok(())
    }

    /// Apply an owner's ref update, or park a non-owner's as pending.
    ///
    /// A client that read the head on this session may move it anywhere,
    /// including to a merge commit that does not descend from it, as long
    /// as nobody moved it in between. Without a prior read only a
    /// fast-forward is accepted.
    async fn update_head(&self, session: &Session, observed: Option<Option<ObjectId>>, tip: ObjectId) -> Result<()> {
        let session = session.clone();
        blocking(&self.state.fs, move |fs| {
            let repo_id = &session.repository.id;
            let store = fs.store(repo_id)?;
            if !store.contains(&tip) {
                return Err(StashError::ObjectNotFound(tip));
            }
            if !session.is_owner() {
                fs.record_pending_change(repo_id, &session.branch, &session.user, tip)?;
                return Ok(());
            }

            let expected = match observed {
                Some(head) => head,
                None => {
                    let current = fs.head(repo_id, &session.branch)?;
                    if !can_fast_forward(&store, current, Some(tip))? {
                        return Err(StashError::NonFastForward(format!(
                            "{} is not a descendant of the current tip of {}",
                            tip, session.branch
                        )));
                    }
                    current
                }
            };
            fs.compare_and_set_head(repo_id, &session.branch, expected, tip)?;
            tracing::info!("{}@{} -> {}", session.repository.name, session.branch, tip);
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(fs: &FileSystem, f: F) -> Result<T>
where
    F: FnOnce(&FileSystem) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let fs = fs.clone();
    tokio::task::spawn_blocking(move || f(&fs))
        .await
        .map_err(|e| StashError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthProvider;
    use crate::object::{Commit, ObjectKind, Tree};
    use crate::packfile::PackWriter;
    use tempfile::TempDir;
    use tokio::io::duplex;

    struct Fixture {
        _tmp: TempDir,
        server: Server,
        fs: FileSystem,
        repo: RepositoryRecord,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let fs = FileSystem::new(tmp.path().join("repos"));
        let registry_path = tmp.path().join("registry.json");
        let mut registry = RepositoryRegistry::default();
        let repo = registry.register("project", "alice").unwrap();
        registry.save(&registry_path).unwrap();
        fs.allocate_repository(&repo.id).unwrap();

        let auth = StaticAuthProvider::new().with_user("alice", "pw").with_user("bob", "pw");
        let server = Server::new(fs.clone(), registry_path, Arc::new(auth));
        Fixture {
            _tmp: tmp,
            server,
            fs,
            repo,
        }
    }

    async fn connect(server: &Server, login: &str) -> (Connection<tokio::io::DuplexStream>, Command) {
        let (client, remote) = duplex(256 * 1024);
        let server = server.clone();
        tokio::spawn(async move { server.handle_connection(remote, "test".into()).await });
        let channel = SecureChannel::establish(client, CipherSuite::default(), None).await.unwrap();
        let mut conn = Connection::new(channel);
        let reply = conn
            .request(&Command::Login(LoginRequest::parse(login).unwrap()))
            .await
            .unwrap();
        (conn, reply)
    }

    fn commit_pack(parent: Option<ObjectId>, message: &str) -> (ObjectId, Vec<u8>) {
        let tree = Tree::new();
        let tree_payload = tree.serialize();
        let commit = Commit::new(parent, tree.id(), message);
        let commit_payload = commit.serialize();
        let mut writer = PackWriter::new();
        writer.add_object(&tree.id(), &tree_payload).unwrap();
        writer.add_object(&commit.id(), &commit_payload).unwrap();
        (commit.id(), writer.finish())
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let f = fixture();
        let (_c, reply) = connect(&f.server, "alice@project@main@wrong").await;
        assert!(matches!(reply, Command::Error(_)));
        let (_c, reply) = connect(&f.server, "alice@nope@main@pw").await;
        assert!(matches!(reply, Command::Error(_)));
        let (_c, reply) = connect(&f.server, "alice@project@..@pw").await;
        assert!(matches!(reply, Command::Error(_)));
    }

    #[tokio::test]
    async fn test_login_creates_branch() {
        let f = fixture();
        let (mut conn, reply) = connect(&f.server, "alice@project.stash@feature@pw").await;
        assert_eq!(reply, Command::Authorized);
        assert_eq!(f.fs.head(&f.repo.id, "feature").unwrap(), None);

        let head = conn.request(&Command::ReceiveHeadCommit("feature".into())).await.unwrap();
        assert_eq!(head, Command::SendObject(Some(Vec::new())));
    }

    #[tokio::test]
    async fn test_packfile_then_update_head() {
        let f = fixture();
        let (mut conn, _) = connect(&f.server, "alice@project@main@pw").await;
        let (commit, pack) = commit_pack(None, "c1");

        conn.send_bulk(BulkKind::Packfile, pack).await.unwrap();
        conn.expect_ok().await.unwrap();
        conn.send(&Command::UpdateHead(commit)).await.unwrap();
        conn.expect_ok().await.unwrap();
        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), Some(commit));

        let reply = conn.request(&Command::ReceiveObject(commit)).await.unwrap();
        let Command::SendObject(Some(payload)) = reply else {
            panic!("expected object payload");
        };
        assert_eq!(ObjectId::compute(ObjectKind::Commit, &payload), commit);

        let missing = conn
            .request(&Command::ReceiveObject(ObjectId::new([3; 20])))
            .await
            .unwrap();
        assert_eq!(missing, Command::SendObject(None));
    }

    #[tokio::test]
    async fn test_bad_packfile_still_gets_a_reply() {
        let f = fixture();
        let (mut conn, _) = connect(&f.server, "alice@project@main@pw").await;
        conn.send(&Command::SendPackfile(b"not a packfile".to_vec())).await.unwrap();
        assert!(matches!(conn.expect_ok().await, Err(StashError::Remote(_))));

        // The connection stays usable.
        let head = conn.request(&Command::ReceiveHeadCommit("main".into())).await.unwrap();
        assert_eq!(head, Command::SendObject(Some(Vec::new())));
    }

    #[tokio::test]
    async fn test_non_owner_update_is_pending() {
        let f = fixture();
        let (mut conn, _) = connect(&f.server, "bob@project@main@pw").await;
        let (commit, pack) = commit_pack(None, "c1");
        conn.send_bulk(BulkKind::Packfile, pack).await.unwrap();
        conn.expect_ok().await.unwrap();
        conn.send(&Command::UpdateHead(commit)).await.unwrap();
        conn.expect_ok().await.unwrap();

        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), None);
        let pending = f.fs.pending_changes(&f.repo.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].author, "bob");
        assert_eq!(pending[0].tip, commit);
    }

    async fn push(conn: &mut Connection<tokio::io::DuplexStream>, commit: ObjectId, pack: Vec<u8>) -> Result<()> {
        conn.send_bulk(BulkKind::Packfile, pack).await?;
        conn.expect_ok().await?;
        conn.send(&Command::UpdateHead(commit)).await?;
        conn.expect_ok().await
    }

    #[tokio::test]
    async fn test_racing_owner_updates_do_not_overwrite() {
        let f = fixture();
        let (mut first, _) = connect(&f.server, "alice@project@main@pw").await;
        let (mut second, _) = connect(&f.server, "alice@project@main@pw").await;
        let empty = Command::SendObject(Some(Vec::new()));
        assert_eq!(first.request(&Command::ReceiveHeadCommit("main".into())).await.unwrap(), empty);
        assert_eq!(second.request(&Command::ReceiveHeadCommit("main".into())).await.unwrap(), empty);

        let (one, pack_one) = commit_pack(None, "one");
        let (two, pack_two) = commit_pack(None, "two");
        push(&mut first, one, pack_one).await.unwrap();
        let lost = push(&mut second, two, pack_two).await;
        assert!(matches!(lost, Err(StashError::Remote(_))));
        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), Some(one));

        // after reading the new head the second client may replace it
        let head = second.request(&Command::ReceiveHeadCommit("main".into())).await.unwrap();
        assert_eq!(head, Command::SendObject(Some(one.to_hex().into_bytes())));
        second.send(&Command::UpdateHead(two)).await.unwrap();
        second.expect_ok().await.unwrap();
        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), Some(two));
    }

    #[tokio::test]
    async fn test_unread_head_only_fast_forwards() {
        let f = fixture();
        let (mut conn, _) = connect(&f.server, "alice@project@main@pw").await;
        let (c1, pack) = commit_pack(None, "c1");
        push(&mut conn, c1, pack).await.unwrap();
        let (c2, pack) = commit_pack(Some(c1), "c2");
        push(&mut conn, c2, pack).await.unwrap();
        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), Some(c2));

        // a fresh session that never read the head cannot move it sideways
        let (mut other, _) = connect(&f.server, "alice@project@main@pw").await;
        let (unrelated, pack) = commit_pack(None, "unrelated");
        assert!(matches!(push(&mut other, unrelated, pack).await, Err(StashError::Remote(_))));
        assert_eq!(f.fs.head(&f.repo.id, "main").unwrap(), Some(c2));
    }

    #[tokio::test]
    async fn test_update_head_requires_object() {
        let f = fixture();
        let (mut conn, _) = connect(&f.server, "alice@project@main@pw").await;
        conn.send(&Command::UpdateHead(ObjectId::new([8; 20]))).await.unwrap();
        assert!(matches!(conn.expect_ok().await, Err(StashError::Remote(_))));
    }
}
