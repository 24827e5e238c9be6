//! Owner-only permission tightening.
//!
//! Symlinks are never followed or changed. A mode is only ever narrowed:
//! entries already at or below the target are left alone.

use serde::Serialize;

use std::path::{Path, PathBuf};

pub const OWNER_ONLY_DIR: u32 = 0o700;
pub const OWNER_ONLY_FILE: u32 = 0o600;

/// How deep to descend into the credentials directory.
const MAX_CREDENTIAL_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Already,
    Missing,
    Symlink,
    NotAFile,
    NotADirectory,
    Unsupported,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Already => "already",
            SkipReason::Missing => "missing",
            SkipReason::Symlink => "symlink",
            SkipReason::NotAFile => "not-a-file",
            SkipReason::NotADirectory => "not-a-directory",
            SkipReason::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Applied { previous: String },
    Skipped { reason: SkipReason },
    Error { message: String },
}

/// One chmod attempt and what came of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionAction {
    pub kind: EntryKind,
    pub path: PathBuf,
    pub mode: String,
    #[serde(flatten)]
    pub outcome: PermissionOutcome,
}

impl PermissionAction {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, PermissionOutcome::Error { .. })
    }
}

fn format_mode(mode: u32) -> String {
    format!("{:03o}", mode & 0o777)
}

/// Narrow `path` to `mode` if it is the expected kind of entry.
pub fn tighten(path: &Path, kind: EntryKind, mode: u32) -> PermissionAction {
    let outcome = tighten_outcome(path, kind, mode);
    if let PermissionOutcome::Error { message } = &outcome {
        tracing::warn!(path = %path.display(), %message, "failed to tighten permissions");
    }
    PermissionAction {
        kind,
        path: path.to_path_buf(),
        mode: format_mode(mode),
        outcome,
    }
}

#[cfg(unix)]
fn tighten_outcome(path: &Path, kind: EntryKind, mode: u32) -> PermissionOutcome {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return PermissionOutcome::Skipped {
                reason: SkipReason::Missing,
            };
        }
        Err(error) => {
            return PermissionOutcome::Error {
                message: error.to_string(),
            };
        }
    };

    let file_type = metadata.file_type();
    let reason = if file_type.is_symlink() {
        Some(SkipReason::Symlink)
    } else if kind == EntryKind::Dir && !file_type.is_dir() {
        Some(SkipReason::NotADirectory)
    } else if kind == EntryKind::File && !file_type.is_file() {
        Some(SkipReason::NotAFile)
    } else {
        None
    };
    if let Some(reason) = reason {
        return PermissionOutcome::Skipped { reason };
    }

    let current = metadata.permissions().mode() & 0o777;
    if current & !mode == 0 {
        return PermissionOutcome::Skipped {
            reason: SkipReason::Already,
        };
    }

    match std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        Ok(()) => PermissionOutcome::Applied {
            previous: format_mode(current),
        },
        Err(error) => PermissionOutcome::Error {
            message: error.to_string(),
        },
    }
}

#[cfg(not(unix))]
fn tighten_outcome(_path: &Path, _kind: EntryKind, _mode: u32) -> PermissionOutcome {
    PermissionOutcome::Skipped {
        reason: SkipReason::Unsupported,
    }
}

/// Tighten the credentials directory and everything stored below it.
pub fn tighten_credentials_dir(dir: &Path, actions: &mut Vec<PermissionAction>) {
    let action = tighten(dir, EntryKind::Dir, OWNER_ONLY_DIR);
    let descend = matches!(
        action.outcome,
        PermissionOutcome::Applied { .. }
            | PermissionOutcome::Skipped {
                reason: SkipReason::Already
            }
    );
    actions.push(action);
    if descend {
        tighten_credential_entries(dir, 1, actions);
    }
}

fn tighten_credential_entries(dir: &Path, depth: usize, actions: &mut Vec<PermissionAction>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(%error, dir = %dir.display(), "failed to list credentials directory");
            return;
        }
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            actions.push(tighten(&path, EntryKind::Dir, OWNER_ONLY_DIR));
            if depth < MAX_CREDENTIAL_DEPTH {
                tighten_credential_entries(&path, depth + 1, actions);
            }
        } else {
            // Symlinks land here and are reported as skipped.
            actions.push(tighten(&path, EntryKind::File, OWNER_ONLY_FILE));
        }
    }
}
