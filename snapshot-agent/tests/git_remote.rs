//! Git sync with the real `git` binary against a local bare remote.

use flate2::read::GzDecoder;
use snapshot_agent::config::{Config, SyncMode, SyncPolicy};
use snapshot_agent::crypto::{EncryptionKey, EncryptionManager};
use snapshot_agent::Engine;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const PLAINTEXT: &str = "DB_PASSWORD=never-in-the-remote";

fn git(args: &[&str]) -> Output {
    Command::new("git").args(args).output().unwrap()
}

fn bare_remote(root: &Path) -> String {
    let remote = root.join("remote.git");
    let output = git(&["init", "--bare", remote.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    remote.to_string_lossy().into_owned()
}

/// Paths in the remote branch tree
fn remote_tree(remote: &str) -> Vec<String> {
    let output = git(&["--git-dir", remote, "ls-tree", "-r", "--name-only", "main"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("README.md"), "# billing").unwrap();
    fs::write(dir.path().join("src/server.ts"), "listen(3000);").unwrap();
    fs::write(dir.path().join(".env"), PLAINTEXT).unwrap();
    dir
}

fn engine(root: &Path, remote: &str) -> Engine {
    let mut config = Config::default();
    config.project.name = "billing".into();
    config.project.root = root.to_path_buf();
    config.remote.enabled = true;
    config.remote.url = Some(remote.to_string());
    Engine::new(config, Some(EncryptionManager::new(&EncryptionKey::generate())))
}

#[tokio::test]
async fn test_default_sync_pushes_only_the_encrypted_artifact() {
    let src = project();
    let remotes = TempDir::new().unwrap();
    let remote = bare_remote(remotes.path());
    let engine = engine(src.path(), &remote);

    let outcome = engine.sync_to_remote(SyncMode::Git, SyncPolicy::Override).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.destination.as_deref(), Some("git"));
    assert!(outcome.push.as_ref().unwrap().push_success);
    assert!(!outcome.forced_rewrite);

    let tree = remote_tree(&remote);
    assert_eq!(tree.len(), 1, "{:?}", tree);
    assert!(tree[0].starts_with("backups/billing-"), "{:?}", tree);
    assert!(tree[0].ends_with(".tar.gz"), "{:?}", tree);
    assert!(!git(&["--git-dir", &remote, "show", "main:.env"]).status.success());

    let blob = git(&["--git-dir", &remote, "show", &format!("main:{}", tree[0])]);
    let mut archive = tar::Archive::new(GzDecoder::new(blob.stdout.as_slice()));
    let mut names = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert!(!String::from_utf8_lossy(&data).contains(PLAINTEXT));
        names.push(entry.path().unwrap().to_string_lossy().into_owned());
    }
    assert!(names.iter().any(|n| n.ends_with("/.env.encrypted")), "{:?}", names);

    // the project checkout itself is never turned into a repository
    assert!(!src.path().join(".git").exists());
}

#[tokio::test]
async fn test_second_sync_fast_forwards() {
    let src = project();
    let remotes = TempDir::new().unwrap();
    let remote = bare_remote(remotes.path());
    let engine = engine(src.path(), &remote);

    let first = engine.sync_to_remote(SyncMode::Git, SyncPolicy::Override).await;
    assert!(first.success, "{:?}", first.error);
    let second = engine.sync_to_remote(SyncMode::Git, SyncPolicy::Override).await;
    assert!(second.success, "{:?}", second.error);

    let push = second.push.unwrap();
    assert!(push.push_success);
    assert_eq!(push.attempts, 1);
    assert_ne!(first.artifact, second.artifact);
    assert_eq!(remote_tree(&remote).len(), 2);
}
