//! Sync client: push, pull and clone
//!
//! A [`RemoteSession`] is one authenticated connection bound to a branch;
//! requests are strictly one at a time. Transfers are history-complete:
//! every commit between the two tips moves together with the tree and blob
//! objects it needs that the receiver lacks, so ancestor walks and merges
//! work on both sides afterwards.
//!
//! Local stores keep a closure invariant: an object is only written after
//! everything it references, so finding an object locally means its whole
//! subgraph is present too.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{ClientOptions, Remote, RemoteConfig};
use crate::error::{Result, StashError};
use crate::merge::{MergeOutcome, can_fast_forward, merged_base};
use crate::object::{Commit, ObjectId, ObjectKind, Tree};
use crate::packfile::{Prepfile, build_packfile};
use crate::protocol::{BulkKind, Command, Connection, LoginRequest, StreamBuffer, unexpected};
use crate::repository::{Repository, apply_tree_to_directory};
use crate::store::ObjectStore;
use crate::transport::SecureChannel;

/// Prefix of the throwaway branch a pull merges from
pub const PULL_BRANCH_PREFIX: &str = "remote_pull_";

/// Name of the remote written by clone
pub const ORIGIN: &str = "origin";

/// Something objects can be fetched from by id
#[async_trait]
pub trait ObjectSource: Send {
    async fn fetch(&mut self, id: &ObjectId) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
impl ObjectSource for ObjectStore {
    async fn fetch(&mut self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.try_get(id)
    }
}

/// Authenticated connection to one repository branch
pub struct RemoteSession<S> {
    conn: Connection<S>,
    branch: String,
}

impl RemoteSession<TcpStream> {
    /// Connect to `remote` and log in for `branch`
    pub async fn connect(remote: &Remote, branch: &str, options: &ClientOptions) -> Result<Self> {
        let connect = TcpStream::connect(&remote.address);
        let stream = match options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| StashError::Timeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {}", remote.address);
        Self::login(stream, &remote.fingerprint.repository, branch, options).await
    }
}

impl<S> RemoteSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the key exchange and log in over an established stream
    pub async fn login(stream: S, repository: &str, branch: &str, options: &ClientOptions) -> Result<Self> {
        let channel = SecureChannel::establish(stream, options.cipher, options.read_timeout).await?;
        let mut conn = Connection::new(channel);
        let login = LoginRequest::new(
            &options.credentials.username,
            repository,
            branch,
            &options.credentials.password,
        );
        match conn.request(&Command::Login(login)).await? {
            Command::Authorized => Ok(Self {
                conn,
                branch: branch.to_string(),
            }),
            Command::Error(message) => Err(StashError::AuthenticationFailed(message)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Tip of a remote branch; `None` if it has no commits
    pub async fn head_commit(&mut self, branch: &str) -> Result<Option<ObjectId>> {
        match self.conn.request(&Command::ReceiveHeadCommit(branch.to_string())).await? {
            Command::SendObject(Some(contents)) => {
                let text = String::from_utf8(contents)
                    .map_err(|_| StashError::Protocol("ref contents are not UTF-8".into()))?;
                ObjectId::parse_optional(&text)
            }
            Command::SendObject(None) => Ok(None),
            Command::Error(message) => Err(StashError::Remote(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Upload a packfile and wait for the server's verdict
    pub async fn send_packfile(&mut self, data: Vec<u8>) -> Result<()> {
        self.conn.send_bulk(BulkKind::Packfile, data).await?;
        self.conn.expect_ok().await
    }

    /// Move the session branch to `tip`
    pub async fn update_head(&mut self, tip: ObjectId) -> Result<()> {
        self.conn.send(&Command::UpdateHead(tip)).await?;
        self.conn.expect_ok().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn.shutdown().await
    }
}

#[async_trait]
impl<S> ObjectSource for RemoteSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn fetch(&mut self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.conn.send(&Command::ReceiveObject(*id)).await?;
        let mut stream = StreamBuffer::default();
        loop {
            match self.conn.recv().await? {
                Command::SendStream(chunk) => stream.push(&chunk)?,
                Command::SendObject(inline) => return Ok(stream.take()?.or(inline)),
                Command::Error(message) => return Err(StashError::Remote(message)),
                other => return Err(unexpected(&other)),
            }
        }
    }
}

async fn fetch_verified<O>(source: &mut O, id: &ObjectId, kind: ObjectKind) -> Result<Vec<u8>>
where
    O: ObjectSource + ?Sized,
{
    let payload = source.fetch(id).await?.ok_or(StashError::ObjectNotFound(*id))?;
    if ObjectId::compute(kind, &payload) != *id {
        return Err(StashError::MalformedObject(format!("remote {} {} failed verification", kind, id)));
    }
    Ok(payload)
}

/// Fetch every object below `tree` that `store` lacks. Children are stored
/// before their parent tree. Returns how many objects were written.
pub async fn download_tree<O>(source: &mut O, store: &ObjectStore, tree: ObjectId) -> Result<usize>
where
    O: ObjectSource + ?Sized,
{
    let mut written = 0;
    let mut stack: Vec<(ObjectId, Option<Vec<u8>>)> = vec![(tree, None)];
    while let Some((id, fetched)) = stack.pop() {
        if store.contains(&id) {
            continue;
        }
        if let Some(payload) = fetched {
            store.insert(&id, &payload)?;
            written += 1;
            continue;
        }

        let payload = fetch_verified(source, &id, ObjectKind::Tree).await?;
        let parsed = Tree::parse(&payload)?;
        stack.push((id, Some(payload)));
        for entry in parsed.entries {
            if store.contains(&entry.id) {
                continue;
            }
            match entry.kind {
                ObjectKind::Tree => stack.push((entry.id, None)),
                _ => {
                    let blob = fetch_verified(source, &entry.id, ObjectKind::Blob).await?;
                    store.insert(&entry.id, &blob)?;
                    written += 1;
                }
            }
        }
    }
    Ok(written)
}

/// Fetch the commits from `tip` back to the first one already present,
/// each with its missing tree objects. Commits are stored oldest first.
pub async fn download_history<O>(source: &mut O, store: &ObjectStore, tip: ObjectId) -> Result<usize>
where
    O: ObjectSource + ?Sized,
{
    let mut chain = Vec::new();
    let mut cursor = Some(tip);
    while let Some(id) = cursor {
        if store.contains(&id) {
            break;
        }
        let payload = fetch_verified(source, &id, ObjectKind::Commit).await?;
        let commit = Commit::parse(&payload)?;
        cursor = commit.parent;
        chain.push((id, payload, commit.tree));
    }

    let mut written = 0;
    for (id, payload, tree) in chain.into_iter().rev() {
        written += download_tree(source, store, tree).await?;
        store.insert(&id, &payload)?;
        written += 1;
    }
    tracing::debug!("downloaded {} objects up to {}", written, tip);
    Ok(written)
}

/// Select the objects a remote holding `base` needs to reach `local_tip`:
/// every commit after `base`, plus each commit's tree objects that differ
/// from its parent's tree. `base` is the remote tip for a fast-forward, or
/// the common ancestor when the remote tip was merged in; it must be in the
/// history of `local_tip`.
pub fn push_prepfile(store: &ObjectStore, local_tip: ObjectId, base: Option<ObjectId>) -> Result<Prepfile> {
    let mut commits = Vec::new();
    let mut cursor = Some(local_tip);
    while cursor != base {
        let Some(id) = cursor else {
            return Err(StashError::NonFastForward(format!(
                "{} is not in the history of {}",
                crate::object::optional_hex(base),
                local_tip
            )));
        };
        let commit = store.read_commit(&id)?;
        cursor = commit.parent;
        commits.push((id, commit));
    }

    let mut prepfile = Prepfile::new();
    for (id, commit) in commits.iter().rev() {
        let base = match commit.parent {
            Some(parent) => Some(store.read_commit(&parent)?.tree),
            None => None,
        };
        collect_tree_changes(store, base, commit.tree, &mut prepfile)?;
        prepfile.push(*id, ObjectKind::Commit);
    }
    Ok(prepfile)
}

/// Walk `tree` alongside `base`, selecting objects that differ. Subtrees
/// without a counterpart in `base` are selected in full.
fn collect_tree_changes(
    store: &ObjectStore,
    base: Option<ObjectId>,
    tree: ObjectId,
    prepfile: &mut Prepfile,
) -> Result<()> {
    let mut stack = vec![(base, tree)];
    while let Some((base, tree)) = stack.pop() {
        if base == Some(tree) || !prepfile.push(tree, ObjectKind::Tree) {
            continue;
        }
        let base_entries = match base {
            Some(base) => store.read_tree(&base)?.to_map(),
            None => Default::default(),
        };
        for entry in store.read_tree(&tree)?.entries {
            let counterpart = base_entries.get(&entry.path);
            if counterpart.map(|(id, _)| *id) == Some(entry.id) {
                continue;
            }
            match entry.kind {
                ObjectKind::Tree => {
                    let base_subtree = counterpart
                        .filter(|(_, kind)| *kind == ObjectKind::Tree)
                        .map(|(id, _)| *id);
                    stack.push((base_subtree, entry.id));
                }
                kind => {
                    prepfile.push(entry.id, kind);
                }
            }
        }
    }
    Ok(())
}

/// Result of a successful push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub branch: String,
    pub previous: Option<ObjectId>,
    pub tip: ObjectId,
    pub objects: usize,
}

/// Push the current branch over an existing session
pub async fn push_over<S>(session: &mut RemoteSession<S>, repo: &Repository) -> Result<PushReport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let branch = session.branch().to_string();
    let local_tip = repo
        .head_commit(&branch)?
        .ok_or_else(|| StashError::NoChangesToSync(format!("branch '{}' has no commits", branch)))?;
    let remote_tip = session.head_commit(&branch).await?;
    if remote_tip == Some(local_tip) {
        return Err(StashError::NoChangesToSync(format!("remote '{}' is up to date", branch)));
    }
    let base = match remote_tip {
        Some(remote) if !can_fast_forward(repo.store(), Some(remote), Some(local_tip))? => {
            // After a three-way pull the remote tip is merged into the local
            // snapshot but is not an ancestor of the merge commit
            let merged = if repo.store().contains(&remote) {
                merged_base(repo.store(), local_tip, remote)?
            } else {
                None
            };
            let Some(ancestor) = merged else {
                return Err(StashError::NonFastForward(format!(
                    "remote '{}' has changes that are not in the local branch; pull first",
                    branch
                )));
            };
            tracing::debug!("remote {} is merged into {}, sending commits after {}", remote, local_tip, ancestor);
            Some(ancestor)
        }
        base => base,
    };

    let prepfile = push_prepfile(repo.store(), local_tip, base)?;
    tracing::debug!("prepfile for {}:\n{}", branch, prepfile.render());
    let pack = build_packfile(repo.store(), &prepfile)?;
    session.send_packfile(pack).await?;
    session.update_head(local_tip).await?;

    Ok(PushReport {
        branch,
        previous: remote_tip,
        tip: local_tip,
        objects: prepfile.len(),
    })
}

/// Fetch the remote branch and merge it into the current branch through a
/// temporary local branch
pub async fn pull_over<S>(session: &mut RemoteSession<S>, repo: &Repository) -> Result<MergeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let branch = session.branch().to_string();
    let remote_tip = session
        .head_commit(&branch)
        .await?
        .ok_or_else(|| StashError::NoChangesToSync(format!("remote '{}' has no commits", branch)))?;
    let written = download_history(session, repo.store(), remote_tip).await?;
    tracing::debug!("pulled {} objects for {}", written, branch);

    let temp = format!("{}{}", PULL_BRANCH_PREFIX, chrono::Utc::now().timestamp_millis());
    repo.create_branch(&temp, Some(remote_tip))?;
    let outcome = repo.merge(&temp);
    if let Err(e) = repo.delete_branch(&temp) {
        tracing::warn!("failed to remove temporary branch {}: {}", temp, e);
    }
    outcome
}

/// Clone the session branch into a new repository at `target`
pub async fn clone_over<S>(session: &mut RemoteSession<S>, remote: &Remote, target: &Path) -> Result<Repository>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if target.exists() && target.read_dir()?.next().is_some() {
        return Err(StashError::InvalidArgument(format!("{:?} exists and is not empty", target)));
    }
    let branch = session.branch().to_string();
    let remote_tip = session.head_commit(&branch).await?;

    let repo = Repository::init(target)?;
    if !repo.branch_exists(&branch)? {
        repo.create_branch(&branch, None)?;
    }
    repo.checkout(&branch, false)?;

    if let Some(tip) = remote_tip {
        download_history(session, repo.store(), tip).await?;
        repo.set_head_commit(&branch, Some(tip))?;
        let tree = repo.read_commit(&tip)?.tree;
        apply_tree_to_directory(repo.store(), &tree, repo.work_dir())?;
    }

    let mut remotes = RemoteConfig::default();
    remotes.add(Remote::new(ORIGIN, remote.fingerprint.clone()).with_address(remote.address.clone()))?;
    remotes.save(&repo.config_path())?;
    tracing::info!("cloned {} into {:?}", remote.fingerprint, repo.work_dir());
    Ok(repo)
}

/// Push the current branch to `remote`
pub async fn push(repo: &Repository, remote: &Remote, options: &ClientOptions) -> Result<PushReport> {
    let branch = repo.current_branch()?;
    let mut session = RemoteSession::connect(remote, &branch, options).await?;
    let report = push_over(&mut session, repo).await;
    let _ = session.close().await;
    report
}

/// Pull `remote`'s copy of the current branch into it
pub async fn pull(repo: &Repository, remote: &Remote, options: &ClientOptions) -> Result<MergeOutcome> {
    let branch = repo.current_branch()?;
    let mut session = RemoteSession::connect(remote, &branch, options).await?;
    let outcome = pull_over(&mut session, repo).await;
    let _ = session.close().await;
    outcome
}

/// Clone `branch` of `remote` into `target`
pub async fn clone(remote: &Remote, branch: &str, target: &Path, options: &ClientOptions) -> Result<Repository> {
    let mut session = RemoteSession::connect(remote, branch, options).await?;
    let repo = clone_over(&mut session, remote, target).await;
    let _ = session.close().await;
    repo
}

/// Directory a clone lands in when none is given: `<repository>-<branch>`
pub fn default_clone_dir(parent: &Path, repository: &str, branch: &str) -> PathBuf {
    parent.join(format!("{}-{}", repository, branch))
}
