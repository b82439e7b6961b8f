use git2::{Repository, Signature};

use crate::error::Result;

const FALLBACK_NAME: &str = "git-convoy";
const FALLBACK_EMAIL: &str = "git-convoy@localhost";

fn from_env(name_var: &str, email_var: &str) -> Option<(String, String)> {
    let name = std::env::var(name_var).ok()?;
    let email = std::env::var(email_var).ok()?;
    if name.is_empty() || email.is_empty() {
        return None;
    }
    Some((name, email))
}

/// Author identity for generated commits: `GIT_AUTHOR_*` wins, then the repo
/// configuration, then a fixed fallback so detached environments still work.
pub fn author(repo: &Repository) -> Result<Signature<'static>> {
    if let Some((name, email)) = from_env("GIT_AUTHOR_NAME", "GIT_AUTHOR_EMAIL") {
        return Ok(Signature::now(&name, &email)?);
    }
    signature_with_fallback(repo)
}

/// Committer identity, honoring `GIT_COMMITTER_*`.
pub fn committer(repo: &Repository) -> Result<Signature<'static>> {
    if let Some((name, email)) = from_env("GIT_COMMITTER_NAME", "GIT_COMMITTER_EMAIL") {
        return Ok(Signature::now(&name, &email)?);
    }
    signature_with_fallback(repo)
}

fn signature_with_fallback(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
    }
}
