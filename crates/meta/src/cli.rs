//! Why some operations shell out to the Git CLI
//!
//! - Network operations: `git fetch` speaks every credential helper and URL
//!   scheme the user has configured. Reimplementing that negotiation on top of
//!   libgit2 callbacks means re-teaching it about ssh agents, helpers, and
//!   proxies one bug report at a time.
//! - Working-tree recovery: `git reset --merge` knows how to unwind a
//!   conflicted working tree without clobbering unrelated local changes.
//!   libgit2 has no equivalent primitive.
//!
//! Everything else — graph queries, tree and index surgery, commit creation —
//! stays on libgit2, where no subprocess round-trip is needed.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{Command, Stdio},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    /// Fetch a single object (and its history) from `url` into the repository
    /// at `repo_path`. Terminal prompts are disabled so a missing credential
    /// fails fast instead of hanging a parallel fan-out.
    pub fn fetch_sha(&self, repo_path: &Path, url: &str, sha: &str) -> Result<(), GitCliError> {
        let envs = [(OsString::from("GIT_TERMINAL_PROMPT"), OsString::from("0"))];
        match self.git_with_env(repo_path, ["fetch", "--no-tags", url, sha], &envs) {
            Ok(_) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) => Err(self.classify_cli_error(msg)),
            Err(err) => Err(err),
        }
    }

    /// Fetch a refspec from `url`, used by stitch when pulling whole sub
    /// histories rather than single pinned commits.
    pub fn fetch_refspec(
        &self,
        repo_path: &Path,
        url: &str,
        refspec: &str,
    ) -> Result<(), GitCliError> {
        let envs = [(OsString::from("GIT_TERMINAL_PROMPT"), OsString::from("0"))];
        match self.git_with_env(repo_path, ["fetch", "--no-tags", url, refspec], &envs) {
            Ok(_) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) => Err(self.classify_cli_error(msg)),
            Err(err) => Err(err),
        }
    }

    /// `git reset --merge`: unwind a conflicted index while preserving local
    /// changes that were not part of the conflict.
    pub fn reset_merge(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["reset", "--merge"]).map(|_| ())
    }

    pub fn reset_hard(&self, repo_path: &Path, sha: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["reset", "--hard", sha]).map(|_| ())
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    /// Prefer the dedicated helpers above so command choices stay centralized;
    /// call this directly only from tests or where no helper exists yet.
    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_impl(repo_path, args, None)
    }

    fn git_with_env<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        envs: &[(OsString, OsString)],
    ) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_impl(repo_path, args, Some(envs))
    }

    fn git_impl<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        envs: Option<&[(OsString, OsString)]>,
    ) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path);
        if let Some(envs) = envs {
            for (k, v) in envs {
                cmd.env(k, v);
            }
        }
        for a in args {
            cmd.arg(a);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::trace!(repo = ?repo_path, "running git command: {:?}", cmd);

        let out = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitCliError::NotAvailable
            } else {
                GitCliError::CommandFailed(e.to_string())
            }
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (true, true) => "command failed with no output".to_string(),
                (false, false) => format!("{stderr}\n{stdout}"),
                (false, true) => stdout,
                (true, false) => stderr,
            };
            return Err(GitCliError::CommandFailed(combined));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    fn classify_cli_error(&self, msg: String) -> GitCliError {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("authentication failed")
            || lower.contains("could not read username")
            || lower.contains("invalid username or password")
        {
            GitCliError::AuthFailed(msg)
        } else {
            GitCliError::CommandFailed(msg)
        }
    }
}
