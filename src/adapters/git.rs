//! Git checkout into a per-run workspace.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_captured, tail, CollaboratorError, SourceControl, SourceTree};

/// Fetches a single revision with `git fetch --depth 1`
pub struct GitCheckout {
    binary_path: String,
    workspaces: PathBuf,
}

impl GitCheckout {
    /// Create a checkout adapter placing workspaces under `workspaces`
    pub fn new(workspaces: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: "git".to_string(),
            workspaces: workspaces.into(),
        }
    }

    async fn git(&self, dir: &std::path::Path, args: &[&str]) -> Result<(), CollaboratorError> {
        let output = run_captured(
            Command::new(&self.binary_path).current_dir(dir).args(args),
            "git",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::Rejected(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                tail(stderr.trim(), 2048)
            )));
        }
        Ok(())
    }
}

/// A revision must be a 7-40 character hex object name
pub fn is_valid_revision(commit: &str) -> bool {
    (7..=40).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl SourceControl for GitCheckout {
    fn name(&self) -> &str {
        "git"
    }

    async fn checkout(
        &self,
        repository: &str,
        commit: &str,
    ) -> Result<SourceTree, CollaboratorError> {
        if !is_valid_revision(commit) {
            return Err(CollaboratorError::Rejected(format!(
                "invalid revision: {}",
                commit
            )));
        }

        tokio::fs::create_dir_all(&self.workspaces)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("workspace directory: {}", e)))?;

        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}-", &commit[..7]))
            .tempdir_in(&self.workspaces)
            .map_err(|e| CollaboratorError::Unavailable(format!("workspace: {}", e)))?;
        let dir = workspace.path().to_path_buf();

        self.git(&dir, &["init", "--quiet"]).await?;
        self.git(&dir, &["fetch", "--quiet", "--depth", "1", repository, commit])
            .await?;
        self.git(
            &dir,
            &["-c", "advice.detachedHead=false", "checkout", "--quiet", "FETCH_HEAD"],
        )
        .await?;

        Ok(SourceTree::owned(commit, workspace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_validation() {
        assert!(is_valid_revision("0123456"));
        assert!(is_valid_revision("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_valid_revision("012345"));
        assert!(!is_valid_revision("main"));
        assert!(!is_valid_revision("0123456789abcdef0123456789abcdef012345678"));
    }

    #[tokio::test]
    async fn test_invalid_revision_rejected_before_fetch() {
        let temp = tempfile::TempDir::new().unwrap();
        let git = GitCheckout::new(temp.path());

        let result = git.checkout("https://example.invalid/repo.git", "not-a-sha").await;
        assert!(matches!(result, Err(CollaboratorError::Rejected(_))));
    }
}
