//! Workspace isolation tests against real git repositories in temp dirs.

mod common;

use common::test_engine;
use std::path::Path;
use std::process::Command;
use taskpilot::domain::errors::EngineError;
use taskpilot::services::{CreateTaskRequest, WorkspaceManager};
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_ok(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A repository with one commit on `main`.
fn seeded_repo() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path();
    git(path, &["init"]);
    git(path, &["config", "user.email", "tests@example.com"]);
    git(path, &["config", "user.name", "Test Runner"]);
    git(path, &["checkout", "-b", "main"]);
    std::fs::write(path.join("README.md"), "seed\n").unwrap();
    git(path, &["add", "-A"]);
    git(path, &["commit", "-m", "seed"]);
    dir
}

#[tokio::test]
async fn test_provision_creates_isolated_checkout() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let manager = WorkspaceManager::new(".isolated");

    let workspace = manager
        .provision("fix login bug", &root, Some("main"), None)
        .await
        .unwrap();

    assert!(!workspace.fallback);
    assert_eq!(workspace.branch, "task/fix_login_bug");
    assert_eq!(workspace.base_branch, "main");
    let worktree = Path::new(&workspace.path);
    assert!(worktree.exists());
    assert!(workspace.path.contains(".isolated"));
    // Worktrees carry a .git file, not a directory.
    assert!(worktree.join(".git").is_file());
    assert!(git_ok(
        repo.path(),
        &["show-ref", "--verify", "--quiet", "refs/heads/task/fix_login_bug"]
    ));
}

#[tokio::test]
async fn test_provision_same_branch_twice_is_rejected() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let manager = WorkspaceManager::new(".isolated");

    manager
        .provision("task-a", &root, Some("main"), Some("feat"))
        .await
        .unwrap();

    let err = manager
        .provision("task-b", &root, Some("main"), Some("feat"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BranchInUse { .. }));
}

#[tokio::test]
async fn test_reclaim_commits_pending_changes_then_removes() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let manager = WorkspaceManager::new(".isolated");

    let workspace = manager
        .provision("commit me", &root, Some("main"), None)
        .await
        .unwrap();
    std::fs::write(Path::new(&workspace.path).join("work.txt"), "changes\n").unwrap();

    manager
        .reclaim(
            &root,
            &workspace.path,
            Some(&workspace.branch),
            Some("main"),
            false,
        )
        .await
        .unwrap();

    assert!(!Path::new(&workspace.path).exists());
    // The branch was cleaned up after the commit landed.
    assert!(!git_ok(
        repo.path(),
        &[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{}", workspace.branch)
        ]
    ));
}

#[tokio::test]
async fn test_reclaim_of_clean_workspace_keeps_main() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let manager = WorkspaceManager::new(".isolated");

    let workspace = manager
        .provision("clean task", &root, Some("main"), None)
        .await
        .unwrap();

    manager
        .reclaim(&root, &workspace.path, Some("main"), Some("main"), false)
        .await
        .unwrap();

    assert!(!Path::new(&workspace.path).exists());
    assert!(git_ok(
        repo.path(),
        &["show-ref", "--verify", "--quiet", "refs/heads/main"]
    ));
}

/// S5 - two active tasks may not share a (root, branch) pair.
#[tokio::test]
async fn test_workspace_collision_at_control_level() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let engine = test_engine().await;

    let request_a = CreateTaskRequest {
        name: "t5a".to_string(),
        owner: "user-1".to_string(),
        description: "first task on feat".to_string(),
        root_path: Some(root.clone()),
        branch: Some("feat".to_string()),
        base_branch: Some("main".to_string()),
        ..Default::default()
    };
    let task_a = engine.control.create(request_a).await.unwrap();
    assert!(task_a.worktree_path.is_some());

    let request_b = CreateTaskRequest {
        name: "t5b".to_string(),
        owner: "user-1".to_string(),
        description: "second task on feat".to_string(),
        root_path: Some(root.clone()),
        branch: Some("feat".to_string()),
        base_branch: Some("main".to_string()),
        ..Default::default()
    };
    let err = engine.control.create(request_b).await.unwrap_err();
    assert!(matches!(err, EngineError::BranchInUse { .. }));

    // The first task is unaffected.
    let task_a = engine.control.get("t5a").await.unwrap();
    assert!(Path::new(task_a.worktree_path.as_deref().unwrap()).exists());
    assert!(engine.control.get("t5b").await.is_err());
}

/// Deleting a task reclaims its workspace; no directory remains.
#[tokio::test]
async fn test_delete_reclaims_workspace() {
    let repo = seeded_repo();
    let root = repo.path().to_string_lossy().into_owned();
    let engine = test_engine().await;

    let request = CreateTaskRequest {
        name: "t-reclaim".to_string(),
        owner: "user-1".to_string(),
        description: "leaves changes behind".to_string(),
        root_path: Some(root.clone()),
        base_branch: Some("main".to_string()),
        ..Default::default()
    };
    let task = engine.control.create(request).await.unwrap();
    let worktree_path = task.worktree_path.clone().unwrap();
    std::fs::write(Path::new(&worktree_path).join("notes.txt"), "pending\n").unwrap();

    engine.control.delete("t-reclaim", false).await.unwrap();

    assert!(!Path::new(&worktree_path).exists());
    assert!(engine.control.get("t-reclaim").await.is_err());
}
