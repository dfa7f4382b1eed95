//! Workspace isolation manager.
//!
//! Gives every task that writes to a version-controlled repository its own
//! checkout under `<root>/<isolated_subdir>/<task>/`, so concurrent tasks on
//! the same repository never see each other's in-progress changes. Reclaim
//! commits pending changes before the checkout is removed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ProjectAccess, ProjectAttachment};

/// Outcome of provisioning one workspace.
#[derive(Debug, Clone)]
pub struct ProvisionedWorkspace {
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    /// True when the repository tooling cannot create independent working
    /// trees and the root checkout is reused. The control surface refuses
    /// creation when another active task already owns it.
    pub fallback: bool,
}

pub struct WorkspaceManager {
    isolated_subdir: String,
    worktrees_supported: OnceCell<bool>,
}

impl WorkspaceManager {
    pub fn new(isolated_subdir: impl Into<String>) -> Self {
        Self {
            isolated_subdir: isolated_subdir.into(),
            worktrees_supported: OnceCell::new(),
        }
    }

    /// Provision an isolated checkout for a task.
    ///
    /// The branch defaults to `task/<slug>` and is created from `base_branch`
    /// when it does not exist yet. A branch already checked out elsewhere
    /// fails with `BranchInUse`. Filesystem and VCS errors are retried once.
    #[instrument(skip(self), fields(task = %task_name, root = %root_path))]
    pub async fn provision(
        &self,
        task_name: &str,
        root_path: &str,
        base_branch: Option<&str>,
        branch: Option<&str>,
    ) -> EngineResult<ProvisionedWorkspace> {
        let root = Path::new(root_path);
        if !is_git_repo(root).await {
            return Err(EngineError::Validation(format!(
                "{root_path} is not a version-controlled repository"
            )));
        }

        let base_branch = match base_branch {
            Some(b) => b.to_string(),
            None => current_branch(root).await.unwrap_or_else(|| "main".to_string()),
        };
        let branch = branch
            .map(str::to_string)
            .unwrap_or_else(|| format!("task/{}", slug(task_name)));

        if !self.supports_worktrees().await {
            warn!("git worktrees unsupported, reusing root checkout");
            return Ok(ProvisionedWorkspace {
                path: root_path.to_string(),
                branch,
                base_branch,
                fallback: true,
            });
        }

        if branch_checked_out(root, &branch).await? {
            return Err(EngineError::BranchInUse {
                root: root_path.to_string(),
                branch,
            });
        }

        let worktree_path = root.join(&self.isolated_subdir).join(slug(task_name));
        if worktree_path.exists() {
            return Err(EngineError::BranchInUse {
                root: root_path.to_string(),
                branch,
            });
        }
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Validation(format!("cannot create {}: {e}", parent.display())))?;
        }

        let mut last_error = None;
        for attempt in 0..2 {
            match self
                .add_worktree(root, &worktree_path, &branch, &base_branch)
                .await
            {
                Ok(()) => {
                    info!(
                        path = %worktree_path.display(),
                        branch = %branch,
                        base_branch = %base_branch,
                        "workspace provisioned"
                    );
                    return Ok(ProvisionedWorkspace {
                        path: worktree_path.to_string_lossy().into_owned(),
                        branch,
                        base_branch,
                        fallback: false,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "worktree creation failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap())
    }

    /// Provision workspaces for every write-access project; read-only
    /// projects are referenced in place.
    pub async fn multi_provision(
        &self,
        task_name: &str,
        projects: &[ProjectAttachment],
    ) -> EngineResult<Vec<(String, ProvisionedWorkspace)>> {
        let mut provisioned: Vec<(ProjectAttachment, ProvisionedWorkspace)> = Vec::new();
        for project in projects {
            if project.access != ProjectAccess::Write {
                continue;
            }
            match self.provision(task_name, &project.path, None, None).await {
                Ok(workspace) => provisioned.push((project.clone(), workspace)),
                Err(e) => {
                    // No partial state: roll back what we already created.
                    for (created_for, workspace) in &provisioned {
                        let _ = self
                            .remove_worktree(Path::new(&created_for.path), &workspace.path, true)
                            .await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(provisioned
            .into_iter()
            .map(|(project, workspace)| (project.name, workspace))
            .collect())
    }

    /// Reclaim a workspace: commit pending changes, remove the working tree,
    /// and delete the task branch when safe.
    ///
    /// A failed commit leaves the workspace intact unless `force` is set.
    #[instrument(skip(self), fields(worktree = %worktree_path))]
    pub async fn reclaim(
        &self,
        root_path: &str,
        worktree_path: &str,
        branch: Option<&str>,
        base_branch: Option<&str>,
        force: bool,
    ) -> EngineResult<()> {
        let root = Path::new(root_path);
        let worktree = Path::new(worktree_path);
        if !worktree.exists() {
            debug!("worktree already gone");
            return Ok(());
        }
        if worktree == root {
            // Fallback workspace: nothing to remove.
            return Ok(());
        }

        let mut committed_cleanly = true;
        if has_pending_changes(worktree).await? {
            let message = format!(
                "Auto-commit pending changes before reclaim ({})",
                worktree
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            );
            match commit_all(worktree, &message).await {
                Ok(()) => info!("pending changes committed"),
                Err(e) => {
                    committed_cleanly = false;
                    if !force {
                        return Err(EngineError::ReclaimBlocked(e.to_string()));
                    }
                    warn!(error = %e, "commit failed, forcing removal");
                }
            }
        }

        self.remove_worktree(root, worktree_path, force).await?;

        if committed_cleanly {
            if let Some(branch) = branch {
                let default_branch = base_branch.unwrap_or("main");
                if branch != default_branch && branch != "main" && branch != "master" {
                    delete_branch(root, branch).await;
                }
            }
        }

        Ok(())
    }

    async fn add_worktree(
        &self,
        root: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> EngineResult<()> {
        let path = worktree_path.to_string_lossy();
        let output = if branch_exists(root, branch).await {
            git(root, &["worktree", "add", &path, branch]).await?
        } else {
            git(root, &["worktree", "add", "-b", branch, &path, base_branch]).await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already checked out") || stderr.contains("already used by worktree") {
                return Err(EngineError::BranchInUse {
                    root: root.to_string_lossy().into_owned(),
                    branch: branch.to_string(),
                });
            }
            return Err(EngineError::Validation(format!(
                "worktree creation failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove_worktree(
        &self,
        root: &Path,
        worktree_path: &str,
        force: bool,
    ) -> EngineResult<()> {
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(worktree_path);

        let output = git(root, &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !force {
                return Err(EngineError::ReclaimBlocked(format!(
                    "worktree removal failed: {}",
                    stderr.trim()
                )));
            }
            warn!(stderr = %stderr.trim(), "git removal failed, deleting directory");
            let _ = tokio::fs::remove_dir_all(worktree_path).await;
            let _ = git(root, &["worktree", "prune"]).await;
        }
        Ok(())
    }

    /// Whether the repository tooling supports independent working trees
    /// (git >= 2.5). Probed once per manager.
    pub async fn supports_worktrees(&self) -> bool {
        *self
            .worktrees_supported
            .get_or_init(|| async {
                let output = Command::new("git")
                    .arg("--version")
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .output()
                    .await;
                match output {
                    Ok(out) if out.status.success() => {
                        parse_git_version(&String::from_utf8_lossy(&out.stdout))
                            .map(|(major, minor)| major > 2 || (major == 2 && minor >= 5))
                            .unwrap_or(false)
                    }
                    _ => false,
                }
            })
            .await
    }
}

/// Sanitize a task name into a directory/branch segment.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

fn parse_git_version(version: &str) -> Option<(u32, u32)> {
    // "git version 2.39.2" -> (2, 39)
    let number = version.split_whitespace().nth(2)?;
    let mut parts = number.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

async fn git(cwd: &Path, args: &[&str]) -> EngineResult<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| EngineError::Validation(format!("git {}: {e}", args.join(" "))))
}

async fn is_git_repo(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    git(path, &["rev-parse", "--git-dir"])
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn current_branch(path: &Path) -> Option<String> {
    let output = git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await.ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

async fn branch_exists(root: &Path, branch: &str) -> bool {
    git(
        root,
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
    .await
    .map(|o| o.status.success())
    .unwrap_or(false)
}

/// Whether any working tree of the repository has the branch checked out.
async fn branch_checked_out(root: &Path, branch: &str) -> EngineResult<bool> {
    let output = git(root, &["worktree", "list", "--porcelain"]).await?;
    if !output.status.success() {
        return Ok(false);
    }
    let needle = format!("branch refs/heads/{branch}");
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == needle))
}

async fn has_pending_changes(worktree: &Path) -> EngineResult<bool> {
    let output = git(worktree, &["status", "--porcelain"]).await?;
    Ok(!output.stdout.is_empty())
}

async fn commit_all(worktree: &Path, message: &str) -> EngineResult<()> {
    let add = git(worktree, &["add", "-A"]).await?;
    if !add.status.success() {
        return Err(EngineError::ReclaimBlocked(
            String::from_utf8_lossy(&add.stderr).trim().to_string(),
        ));
    }
    let commit = git(worktree, &["commit", "-m", message]).await?;
    if !commit.status.success() {
        return Err(EngineError::ReclaimBlocked(
            String::from_utf8_lossy(&commit.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

async fn delete_branch(root: &Path, branch: &str) {
    if let Ok(output) = git(root, &["branch", "-D", branch]).await {
        if !output.status.success() {
            warn!(
                branch,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "branch deletion failed"
            );
        }
    }
}
