use crate::ScmError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const COMMIT_AUTHOR_NAME: &str = "gyre";
const COMMIT_AUTHOR_EMAIL: &str = "gyre@localhost";

/// Thin wrapper around the `git` CLI scoped to one working tree.
#[derive(Clone, Debug)]
pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clone `source` at `branch` into `dest`.
    pub async fn clone_branch(
        source: &str,
        branch: &str,
        dest: impl Into<PathBuf>,
    ) -> Result<Self, ScmError> {
        let dest = dest.into();
        let dest_str = dest.to_string_lossy().to_string();
        run_git_in(
            Path::new("."),
            "clone",
            &["clone", "--branch", branch, source, &dest_str],
            None,
        )
        .await?;
        Ok(Self { root: dest })
    }

    pub async fn create_branch(&self, name: &str) -> Result<(), ScmError> {
        self.run("checkout", &["checkout", "-b", name], None).await?;
        Ok(())
    }

    pub async fn current_branch(&self) -> Result<String, ScmError> {
        let out = self
            .run("rev-parse", &["rev-parse", "--abbrev-ref", "HEAD"], None)
            .await?;
        Ok(out.trim().to_string())
    }

    /// Apply a unified diff to the index and working tree, fed over stdin.
    pub async fn apply_index(&self, diff: &str) -> Result<(), ScmError> {
        self.run("apply", &["apply", "--index", "-"], Some(diff)).await?;
        Ok(())
    }

    pub async fn has_staged_changes(&self) -> Result<bool, ScmError> {
        let mut command = self.command(&["diff", "--cached", "--quiet"]);
        let status = command
            .status()
            .await
            .map_err(|error| ScmError::Io(format!("failed to run git diff: {error}")))?;
        // Exit 1 means the index differs from HEAD.
        Ok(!status.success())
    }

    pub async fn commit(&self, message: &str) -> Result<String, ScmError> {
        self.run(
            "commit",
            &[
                "-c",
                &format!("user.name={COMMIT_AUTHOR_NAME}"),
                "-c",
                &format!("user.email={COMMIT_AUTHOR_EMAIL}"),
                "commit",
                "-m",
                message,
            ],
            None,
        )
        .await?;
        self.head_sha().await
    }

    pub async fn head_sha(&self) -> Result<String, ScmError> {
        let out = self.run("rev-parse", &["rev-parse", "HEAD"], None).await?;
        Ok(out.trim().to_string())
    }

    pub async fn last_commit_message(&self) -> Result<String, ScmError> {
        let out = self
            .run("log", &["log", "-1", "--pretty=%s"], None)
            .await?;
        Ok(out.trim().to_string())
    }

    /// Lease-style force push of HEAD onto the remote branch.
    pub async fn push_with_lease(&self, remote: &str, branch: &str) -> Result<(), ScmError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run(
            "push",
            &["push", "--force-with-lease", remote, &refspec],
            None,
        )
        .await?;
        Ok(())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    async fn run(
        &self,
        action: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, ScmError> {
        run_git_in(&self.root, action, args, stdin).await
    }
}

async fn run_git_in(
    dir: &Path,
    action: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<String, ScmError> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command
        .spawn()
        .map_err(|error| ScmError::Io(format!("failed to spawn git {action}: {error}")))?;
    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|error| ScmError::Io(format!("failed to feed git {action}: {error}")))?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|error| ScmError::Io(format!("failed to wait for git {action}: {error}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScmError::git(action, stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
