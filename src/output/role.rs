//! CP-025: Writing roles and session history to disk.
//!
//! Layout for cookbook `nginx` under `out/`:
//!
//! ```text
//! out/nginx/tasks/main.yml ...        artifact files
//! out/nginx/.cookport/history.json    every attempt of the session
//! out/nginx/.cookport/events.jsonl    session events, appended per run
//! ```

use crate::audit::eventlog::{self, AUDIT_DIR};
use crate::audit::hasher;
use crate::convert::assemble::variable_name;
use crate::convert::session::ConcludedSession;
use crate::error::{ConvertError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What was written for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRole {
    pub dir: PathBuf,
    pub files: usize,
    /// Fingerprint of the role directory; `None` when nothing was produced.
    pub fingerprint: Option<String>,
}

pub fn role_dir(output_root: &Path, cookbook: &str) -> PathBuf {
    output_root.join(variable_name(cookbook))
}

pub fn history_path(role_dir: &Path) -> PathBuf {
    role_dir.join(AUDIT_DIR).join("history.json")
}

/// Write the session's artifact (passing or best effort) and its history.
pub fn write_role(output_root: &Path, session: &ConcludedSession) -> Result<WrittenRole> {
    let dir = role_dir(output_root, &session.cookbook);
    std::fs::create_dir_all(&dir).map_err(|e| ConvertError::io(&dir, e))?;

    let mut files = 0;
    if let Some(artifact) = session.outcome.artifact() {
        for (rel, content) in artifact.iter() {
            write_atomic(&dir.join(rel), content)?;
            files += 1;
        }
    }

    let history = serde_json::to_string_pretty(session)?;
    write_atomic(&history_path(&dir), &history)?;
    eventlog::append_events(&dir, &session.events)?;

    let fingerprint = if files > 0 {
        Some(hasher::hash_directory(&dir)?)
    } else {
        None
    };
    debug!(dir = %dir.display(), files, "role written");
    Ok(WrittenRole {
        dir,
        files,
        fingerprint,
    })
}

/// Write via a temp file and rename.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConvertError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, content).map_err(|e| ConvertError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| ConvertError::io(path, e))?;
    Ok(())
}
