//! End-to-end sync over real TCP: push, clone, pull and their failure modes

use rand::RngCore;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

use stash_core::client;
use stash_core::config::{ClientOptions, Credentials, Remote};
use stash_core::storage::{FileSystem, RepositoryRegistry};
use stash_core::{MergeOutcome, Repository, Server, StashError, StaticAuthProvider};

struct TestServer {
    _tmp: TempDir,
    address: String,
    fs: FileSystem,
    repo_id: String,
}

async fn start_server() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let fs = FileSystem::new(tmp.path().join("repos"));
    let registry_path = tmp.path().join("registry.json");
    let mut registry = RepositoryRegistry::default();
    let record = registry.register("project", "alice").unwrap();
    registry.save(&registry_path).unwrap();
    fs.allocate_repository(&record.id).unwrap();

    let auth = StaticAuthProvider::new().with_user("alice", "pw").with_user("bob", "pw");
    let server = Server::new(fs.clone(), registry_path, Arc::new(auth));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.serve(listener).await });

    TestServer {
        _tmp: tmp,
        address,
        fs,
        repo_id: record.id,
    }
}

fn remote(server: &TestServer, user: &str) -> Remote {
    Remote::new("origin", format!("{}@project.stash", user).parse().unwrap()).with_address(server.address.clone())
}

fn options(user: &str, password: &str) -> ClientOptions {
    ClientOptions::new(Credentials::new(user, password))
}

fn write(repo: &Repository, rel: &str, data: &[u8]) {
    let path = repo.work_dir().join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

fn commit_all(repo: &Repository, msg: &str) {
    repo.add(Path::new(".")).unwrap();
    repo.commit(msg).unwrap();
}

#[tokio::test]
async fn test_push_clone_pull_fast_forward() {
    let server = start_server().await;
    let alice = remote(&server, "alice");

    let work_a = TempDir::new().unwrap();
    let repo_a = Repository::init(work_a.path()).unwrap();
    write(&repo_a, "README", b"hello\n");
    write(&repo_a, "src/main.rs", b"fn main() {}\n");
    commit_all(&repo_a, "initial");

    let report = client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(report.previous, None);
    assert_eq!(report.objects, 5);
    assert_eq!(server.fs.head(&server.repo_id, "main").unwrap(), Some(report.tip));

    // a second push with nothing new is refused
    let again = client::push(&repo_a, &alice, &options("alice", "pw")).await;
    assert!(matches!(again, Err(StashError::NoChangesToSync(_))));

    let parent = TempDir::new().unwrap();
    let target = client::default_clone_dir(parent.path(), "project", "main");
    let repo_b = client::clone(&alice, "main", &target, &options("alice", "pw")).await.unwrap();
    assert_eq!(fs::read(target.join("src/main.rs")).unwrap(), b"fn main() {}\n");
    assert_eq!(repo_b.head_commit("main").unwrap(), Some(report.tip));
    assert!(repo_b.config_path().is_file());

    write(&repo_b, "README", b"hello again\n");
    commit_all(&repo_b, "second");
    let second = client::push(&repo_b, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(second.previous, Some(report.tip));
    // new root tree, README blob, commit
    assert_eq!(second.objects, 3);

    let outcome = client::pull(&repo_a, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(outcome, MergeOutcome::FastForward { tip: second.tip });
    assert_eq!(fs::read(work_a.path().join("README")).unwrap(), b"hello again\n");
    assert_eq!(repo_a.branches().unwrap(), vec!["main".to_string()]);

    let outcome = client::pull(&repo_a, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(outcome, MergeOutcome::UpToDate);
}

#[tokio::test]
async fn test_diverged_push_is_rejected_and_pull_conflicts() {
    let server = start_server().await;
    let alice = remote(&server, "alice");

    let work_a = TempDir::new().unwrap();
    let repo_a = Repository::init(work_a.path()).unwrap();
    write(&repo_a, "shared.txt", b"base\n");
    commit_all(&repo_a, "base");
    client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();

    let parent = TempDir::new().unwrap();
    let repo_b = client::clone(&alice, "main", &parent.path().join("b"), &options("alice", "pw"))
        .await
        .unwrap();

    write(&repo_a, "shared.txt", b"from a\n");
    commit_all(&repo_a, "a edits");
    client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();

    write(&repo_b, "shared.txt", b"from b\n");
    commit_all(&repo_b, "b edits");
    let rejected = client::push(&repo_b, &alice, &options("alice", "pw")).await;
    assert!(matches!(rejected, Err(StashError::NonFastForward(_))));

    let tip_before = repo_b.head_commit("main").unwrap();
    let pulled = client::pull(&repo_b, &alice, &options("alice", "pw")).await;
    assert!(matches!(pulled, Err(StashError::MergeConflict(_))));
    assert_eq!(repo_b.head_commit("main").unwrap(), tip_before);
    assert_eq!(fs::read(repo_b.work_dir().join("shared.txt")).unwrap(), b"from b\n");
    // the temporary pull branch is cleaned up even when the merge fails
    assert_eq!(repo_b.branches().unwrap(), vec!["main".to_string()]);

    // the remote commits are now stored locally but not merged
    let still_rejected = client::push(&repo_b, &alice, &options("alice", "pw")).await;
    assert!(matches!(still_rejected, Err(StashError::NonFastForward(_))));
}

#[tokio::test]
async fn test_pull_merges_disjoint_changes() {
    let server = start_server().await;
    let alice = remote(&server, "alice");

    let work_a = TempDir::new().unwrap();
    let repo_a = Repository::init(work_a.path()).unwrap();
    write(&repo_a, "a.txt", b"a\n");
    commit_all(&repo_a, "base");
    client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();

    let parent = TempDir::new().unwrap();
    let repo_b = client::clone(&alice, "main", &parent.path().join("b"), &options("alice", "pw"))
        .await
        .unwrap();
    write(&repo_b, "b.txt", b"b\n");
    commit_all(&repo_b, "b adds");
    client::push(&repo_b, &alice, &options("alice", "pw")).await.unwrap();

    write(&repo_a, "c.txt", b"c\n");
    commit_all(&repo_a, "a adds");
    let outcome = client::pull(&repo_a, &alice, &options("alice", "pw")).await.unwrap();
    let MergeOutcome::ThreeWay { commit, .. } = outcome else {
        panic!("expected a merge commit, got {:?}", outcome);
    };
    assert_eq!(fs::read(work_a.path().join("b.txt")).unwrap(), b"b\n");
    assert_eq!(repo_a.head_commit("main").unwrap(), Some(commit));

    // the merge commit's only parent is our tip, yet it carries the remote
    // changes, so it may replace the remote head
    let pushed = client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(pushed.tip, commit);
    assert_eq!(server.fs.head(&server.repo_id, "main").unwrap(), Some(commit));

    let outcome = client::pull(&repo_b, &alice, &options("alice", "pw")).await.unwrap();
    assert!(matches!(outcome, MergeOutcome::ThreeWay { .. }));
    for (file, data) in [("a.txt", "a\n"), ("b.txt", "b\n"), ("c.txt", "c\n")] {
        assert_eq!(fs::read_to_string(repo_b.work_dir().join(file)).unwrap(), data);
    }
    client::push(&repo_b, &alice, &options("alice", "pw")).await.unwrap();
    assert_eq!(
        server.fs.head(&server.repo_id, "main").unwrap(),
        repo_b.head_commit("main").unwrap()
    );
}

#[tokio::test]
async fn test_large_file_round_trip() {
    let server = start_server().await;
    let alice = remote(&server, "alice");

    let mut big = vec![0u8; 200 * 1024];
    rand::thread_rng().fill_bytes(&mut big);

    let work_a = TempDir::new().unwrap();
    let repo_a = Repository::init(work_a.path()).unwrap();
    write(&repo_a, "assets/blob.bin", &big);
    commit_all(&repo_a, "binary");
    client::push(&repo_a, &alice, &options("alice", "pw")).await.unwrap();

    let parent = TempDir::new().unwrap();
    let target = parent.path().join("copy");
    client::clone(&alice, "main", &target, &options("alice", "pw")).await.unwrap();
    assert_eq!(fs::read(target.join("assets/blob.bin")).unwrap(), big);
}

#[tokio::test]
async fn test_authentication_and_ownership() {
    let server = start_server().await;

    let work = TempDir::new().unwrap();
    let repo = Repository::init(work.path()).unwrap();
    write(&repo, "f", b"1");
    commit_all(&repo, "c1");

    let denied = client::push(&repo, &remote(&server, "alice"), &options("alice", "wrong")).await;
    assert!(matches!(denied, Err(StashError::AuthenticationFailed(_))));

    // bob is a valid user but not the owner: his push is parked for review
    client::push(&repo, &remote(&server, "bob"), &options("bob", "pw")).await.unwrap();
    assert_eq!(server.fs.head(&server.repo_id, "main").unwrap(), None);
    let pending = server.fs.pending_changes(&server.repo_id).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].author, "bob");
}

#[tokio::test]
async fn test_clone_of_empty_branch_and_non_empty_target() {
    let server = start_server().await;
    let alice = remote(&server, "alice");

    let parent = TempDir::new().unwrap();
    let target = parent.path().join("empty");
    let repo = client::clone(&alice, "feature", &target, &options("alice", "pw")).await.unwrap();
    assert_eq!(repo.current_branch().unwrap(), "feature");
    assert_eq!(repo.head_commit("feature").unwrap(), None);

    let occupied = parent.path().join("occupied");
    fs::create_dir_all(&occupied).unwrap();
    fs::write(occupied.join("file"), b"x").unwrap();
    let refused = client::clone(&alice, "main", &occupied, &options("alice", "pw")).await;
    assert!(matches!(refused, Err(StashError::InvalidArgument(_))));
}
