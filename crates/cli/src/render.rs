//! Text rendering for the `status` command.

use meta::status::{FileChange, Relation, RepoStatus};

fn change_label(change: &FileChange) -> &'static str {
    match change {
        FileChange::Added => "new file",
        FileChange::Modified => "modified",
        FileChange::Deleted => "deleted",
        FileChange::TypeChange => "typechange",
        FileChange::Conflicted => "conflict",
    }
}

fn relation_label(relation: &Relation) -> &'static str {
    match relation {
        Relation::Same => "same",
        Relation::Ahead => "ahead",
        Relation::Behind => "behind",
        Relation::Unrelated => "unrelated",
        Relation::Unknown => "unknown",
    }
}

pub fn render_status(status: &RepoStatus) -> String {
    let mut out = String::new();
    match (&status.current_branch, status.head_commit) {
        (Some(branch), _) => out.push_str(&format!("On branch {branch}\n")),
        (None, Some(oid)) => out.push_str(&format!("HEAD detached at {oid}\n")),
        (None, None) => out.push_str("No commits yet\n"),
    }
    if status.sparse {
        out.push_str("Sparse mode is on\n");
    }
    if let Some(seq) = &status.sequencer {
        let op = match seq.kind {
            meta::SequencerKind::Merge => "merge",
            meta::SequencerKind::CherryPick => "cherry-pick",
            meta::SequencerKind::Rebase => "rebase",
        };
        out.push_str(&format!(
            "A {op} is in progress; run '{op} --continue' or '{op} --abort'\n"
        ));
    } else if status.rebase.is_some() {
        out.push_str("A rebase is in progress\n");
    }

    if !status.staged.is_empty() {
        out.push_str("Changes to be committed:\n");
        for (path, change) in &status.staged {
            out.push_str(&format!("  {}: {path}\n", change_label(change)));
        }
    }
    if !status.workdir.is_empty() {
        out.push_str("Changes not staged for commit:\n");
        for (path, change) in &status.workdir {
            out.push_str(&format!("  {}: {path}\n", change_label(change)));
        }
    }

    if !status.submodules.is_empty() {
        out.push_str("Submodules:\n");
        for (name, sub) in &status.submodules {
            let mut parts: Vec<String> = Vec::new();
            match (&sub.commit, &sub.index) {
                (Some(commit), Some(index)) if commit.sha == index.sha => {
                    parts.push(format!("on {}", commit.sha));
                }
                (commit, index) => {
                    if let Some(commit) = commit {
                        parts.push(format!("head {}", commit.sha));
                    }
                    if let Some(index) = index {
                        parts.push(format!("staged {}", index.sha));
                    } else {
                        parts.push("staged for removal".to_string());
                    }
                }
            }
            if let Some(index) = &sub.index
                && let Some(relation) = &index.relation
                && *relation != Relation::Same
            {
                parts.push(format!("index {}", relation_label(relation)));
            }
            match &sub.workdir {
                Some(workdir) => {
                    if !workdir.status.is_clean(false) {
                        parts.push("dirty".to_string());
                    }
                    if workdir.status.sequencer.is_some() || workdir.status.rebase.is_some() {
                        parts.push("operation in progress".to_string());
                    }
                }
                None => parts.push("closed".to_string()),
            }
            out.push_str(&format!("  {name}: {}\n", parts.join(", ")));
        }
    }
    out
}
