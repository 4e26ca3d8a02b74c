//! Shallow clone with branch fallback, the Builder's first step (§4.3 step 1).
//!
//! ```no_run
//! use reporunner_vcs::shallow_clone_with_fallback;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let branch_used = shallow_clone_with_fallback(
//!     "https://example.invalid/x.git",
//!     "main",
//!     Path::new("/tmp/work/r1"),
//! ).await?;
//! println!("cloned {branch_used}");
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use reporunner_process::run_captured;

/// Shallow-clone `repo` at `branch` into `target_dir`. On failure, retries
/// once with the alternate default branch name (`main` ↔ `master`). Fails
/// the build if both attempts fail.
///
/// Returns the branch name that actually succeeded.
pub async fn shallow_clone_with_fallback(repo: &str, branch: &str, target_dir: &Path) -> Result<String> {
    match clone_attempt(repo, branch, target_dir).await {
        Ok(()) => Ok(branch.to_string()),
        Err(first_err) => {
            let alternate = alternate_branch(branch);
            tracing::warn!(
                repo,
                branch,
                alternate,
                error = %first_err,
                "clone failed, retrying with alternate branch"
            );
            let _ = tokio::fs::remove_dir_all(target_dir).await;
            clone_attempt(repo, alternate, target_dir)
                .await
                .with_context(|| {
                    format!(
                        "clone failed for both '{branch}' and '{alternate}': {first_err}"
                    )
                })?;
            Ok(alternate.to_string())
        }
    }
}

fn alternate_branch(branch: &str) -> &'static str {
    if branch == "main" { "master" } else { "main" }
}

async fn clone_attempt(repo: &str, branch: &str, target_dir: &Path) -> Result<()> {
    if let Some(parent) = target_dir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating clone parent directory {}", parent.display()))?;
    }

    let target = target_dir.to_string_lossy().into_owned();
    let args = [
        "clone",
        "--depth",
        "1",
        "--branch",
        branch,
        "--single-branch",
        repo,
        target.as_str(),
    ];

    let result = run_captured("git", &args, Path::new("."), &[], None)
        .await
        .context("failed to spawn git clone")?;

    result
        .ok()
        .map(|_| ())
        .with_context(|| format!("git clone of '{repo}' at branch '{branch}' failed"))
}

/// Forcibly remove a clone's working directory, clearing read-only
/// attributes first (§4.3 step 4). Failure is logged by the caller and
/// otherwise ignored — a leftover clone directory is not fatal.
pub async fn cleanup_clone(target_dir: &Path) -> Result<()> {
    clear_readonly(target_dir).await;
    tokio::fs::remove_dir_all(target_dir)
        .await
        .with_context(|| format!("removing clone directory {}", target_dir.display()))
}

async fn clear_readonly(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            let mut perms = metadata.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                let _ = tokio::fs::set_permissions(&path, perms).await;
            }
        }
        if path.is_dir() {
            Box::pin(clear_readonly(&path)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternate_branch_swaps_main_and_master() {
        assert_eq!(alternate_branch("main"), "master");
        assert_eq!(alternate_branch("master"), "main");
        assert_eq!(alternate_branch("develop"), "main");
    }

    #[tokio::test]
    async fn clone_attempt_fails_fast_on_bogus_repo() {
        let td = tempfile::tempdir().expect("tempdir");
        let target = td.path().join("clone");
        let result = clone_attempt("not-a-real-remote://nope", "main", &target).await;
        assert!(result.is_err());
    }
}
