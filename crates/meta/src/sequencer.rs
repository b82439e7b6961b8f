//! On-disk record of an in-progress merge, cherry-pick, or rebase.
//!
//! The record is a directory under the gitdir holding one fact per file;
//! `MESSAGE` is written last so a partially written directory is recognizable
//! (the reader treats a malformed `ORIG_HEAD` as "no operation"). The
//! presence of the directory is the sole "operation in progress" signal, and
//! removing it is the final step of every successful operation.

use std::{fs, io::Write, path::PathBuf};

use git2::{Oid, Repository};

use crate::error::{MetaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerKind {
    Merge,
    CherryPick,
    Rebase,
}

impl SequencerKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            SequencerKind::Merge => "META_MERGE",
            SequencerKind::CherryPick => "META_CHERRY_PICK",
            SequencerKind::Rebase => "META_REBASE",
        }
    }

    fn type_name(self) -> &'static str {
        match self {
            SequencerKind::Merge => "merge",
            SequencerKind::CherryPick => "cherry-pick",
            SequencerKind::Rebase => "rebase",
        }
    }

    fn from_type_name(text: &str) -> Option<Self> {
        match text.trim() {
            "merge" => Some(SequencerKind::Merge),
            "cherry-pick" => Some(SequencerKind::CherryPick),
            "rebase" => Some(SequencerKind::Rebase),
            _ => None,
        }
    }
}

/// A commit plus the ref name it was reached through, when there was one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTarget {
    pub sha: Oid,
    pub ref_name: Option<String>,
}

impl RefTarget {
    pub fn new(sha: Oid, ref_name: Option<String>) -> Self {
        Self { sha, ref_name }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerState {
    pub kind: SequencerKind,
    pub original_head: RefTarget,
    pub target: RefTarget,
    pub current_commit: u32,
    pub commits: Vec<Oid>,
    pub message: String,
}

impl SequencerState {
    fn dir(repo: &Repository, kind: SequencerKind) -> PathBuf {
        repo.path().join(kind.dir_name())
    }

    /// Persist the record. Each file lands via temp-then-rename; `MESSAGE`
    /// goes last so readers never observe a complete-looking partial record.
    pub fn write(&self, repo: &Repository) -> Result<()> {
        let dir = Self::dir(repo, self.kind);
        fs::create_dir_all(&dir)?;
        write_file(&dir, "TYPE", self.kind.type_name())?;
        write_file(&dir, "ORIG_HEAD", &self.original_head.sha.to_string())?;
        if let Some(name) = &self.original_head.ref_name {
            write_file(&dir, "HEAD_NAME", name)?;
        }
        write_file(&dir, "ONTO", &self.target.sha.to_string())?;
        if let Some(name) = &self.target.ref_name {
            write_file(&dir, "ONTO_NAME", name)?;
        }
        write_file(&dir, "CURRENT", &self.current_commit.to_string())?;
        let commits: String = self
            .commits
            .iter()
            .map(|oid| format!("{oid}\n"))
            .collect();
        write_file(&dir, "COMMITS", &commits)?;
        write_file(&dir, "MESSAGE", &self.message)?;
        Ok(())
    }

    /// Load the record of the given kind, or `None` when absent or torn.
    pub fn load(repo: &Repository, kind: SequencerKind) -> Result<Option<SequencerState>> {
        let dir = Self::dir(repo, kind);
        if !dir.exists() {
            return Ok(None);
        }
        let Ok(orig) = fs::read_to_string(dir.join("ORIG_HEAD")) else {
            return Ok(None);
        };
        let Ok(original_sha) = Oid::from_str(orig.trim()) else {
            return Ok(None);
        };
        let read = |name: &str| -> Result<String> { Ok(fs::read_to_string(dir.join(name))?) };
        let kind = SequencerKind::from_type_name(&read("TYPE")?)
            .ok_or_else(|| MetaError::Internal(format!("bad sequencer TYPE in {dir:?}")))?;
        let onto = Oid::from_str(read("ONTO")?.trim())
            .map_err(|_| MetaError::Internal(format!("bad sequencer ONTO in {dir:?}")))?;
        let head_name = match fs::read_to_string(dir.join("HEAD_NAME")) {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let onto_name = match fs::read_to_string(dir.join("ONTO_NAME")) {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let current: u32 = read("CURRENT")?
            .trim()
            .parse()
            .map_err(|_| MetaError::Internal(format!("bad sequencer CURRENT in {dir:?}")))?;
        let mut commits = Vec::new();
        for line in read("COMMITS")?.lines() {
            if line.is_empty() {
                continue;
            }
            commits.push(
                Oid::from_str(line)
                    .map_err(|_| MetaError::Internal(format!("bad sequencer COMMITS in {dir:?}")))?,
            );
        }
        let message = read("MESSAGE")?;
        Ok(Some(SequencerState {
            kind,
            original_head: RefTarget::new(original_sha, head_name),
            target: RefTarget::new(onto, onto_name),
            current_commit: current,
            commits,
            message,
        }))
    }

    /// Load whichever operation record exists, if any.
    pub fn load_any(repo: &Repository) -> Result<Option<SequencerState>> {
        for kind in [
            SequencerKind::Merge,
            SequencerKind::CherryPick,
            SequencerKind::Rebase,
        ] {
            if let Some(state) = Self::load(repo, kind)? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Remove the record; the last step of a successful operation.
    pub fn clean(repo: &Repository, kind: SequencerKind) -> Result<()> {
        let dir = Self::dir(repo, kind);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

fn write_file(dir: &std::path::Path, name: &str, content: &str) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        if !content.is_empty() && !content.ends_with('\n') && name != "MESSAGE" {
            f.write_all(b"\n")?;
        }
    }
    fs::rename(tmp, dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_repo() -> (tempfile::TempDir, Repository) {
        let td = tempfile::tempdir().unwrap();
        let repo = Repository::init(td.path()).unwrap();
        (td, repo)
    }

    fn sample(kind: SequencerKind) -> SequencerState {
        SequencerState {
            kind,
            original_head: RefTarget::new(
                Oid::from_str("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap(),
                Some("refs/heads/master".to_string()),
            ),
            target: RefTarget::new(
                Oid::from_str("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap(),
                None,
            ),
            current_commit: 2,
            commits: vec![
                Oid::from_str("cccccccccccccccccccccccccccccccccccccccc").unwrap(),
                Oid::from_str("dddddddddddddddddddddddddddddddddddddddd").unwrap(),
            ],
            message: "merge of topic\n\nwith a body\n".to_string(),
        }
    }

    #[test]
    fn write_load_round_trip() {
        let (_td, repo) = test_repo();
        let state = sample(SequencerKind::Merge);
        state.write(&repo).unwrap();
        let loaded = SequencerState::load(&repo, SequencerKind::Merge)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, state);
        assert_eq!(SequencerState::load_any(&repo).unwrap(), Some(state));
    }

    #[test]
    fn absent_directory_loads_none() {
        let (_td, repo) = test_repo();
        assert!(SequencerState::load(&repo, SequencerKind::Rebase)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_orig_head_loads_none() {
        let (_td, repo) = test_repo();
        let dir = repo.path().join("META_CHERRY_PICK");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ORIG_HEAD"), "not-a-sha\n").unwrap();
        assert!(SequencerState::load(&repo, SequencerKind::CherryPick)
            .unwrap()
            .is_none());
    }

    #[test]
    fn clean_removes_record() {
        let (_td, repo) = test_repo();
        sample(SequencerKind::Rebase).write(&repo).unwrap();
        SequencerState::clean(&repo, SequencerKind::Rebase).unwrap();
        assert!(SequencerState::load_any(&repo).unwrap().is_none());
    }

    #[test]
    fn multiline_message_survives() {
        let (_td, repo) = test_repo();
        let mut state = sample(SequencerKind::Merge);
        state.message = "line one\nline two\n\ntrailer: x\n".to_string();
        state.write(&repo).unwrap();
        let loaded = SequencerState::load(&repo, SequencerKind::Merge)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.message, state.message);
    }
}
