//! One-shot hardening sweep over config defaults and file permissions.
//!
//! The sweep is idempotent: a second run after a successful first run
//! computes no config changes, writes nothing and only reports
//! `skipped: already` permission actions.

pub mod audit;
pub mod permissions;

pub use audit::{AuditFinding, AuditSeverity, AuditSummary, SecurityAuditReport, audit_security};
pub use permissions::{EntryKind, PermissionAction, PermissionOutcome, SkipReason};

use crate::config::{Config, INCLUDE_KEY, collect_include_paths};
use crate::error::SecurityError;
use crate::fs_util::{FileMode, write_atomic};
use crate::pairing::{PairingStore, supports_pairing};
use crate::paths::Paths;

use permissions::{OWNER_ONLY_DIR, OWNER_ONLY_FILE, tighten, tighten_credentials_dir};

use serde::Serialize;
use serde_json::{Map, Value};

use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFixResult {
    /// False only when something actually failed; skips do not count.
    pub ok: bool,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub config_written: bool,
    pub changes: Vec<String>,
    pub actions: Vec<PermissionAction>,
    pub errors: Vec<String>,
}

/// Run the sweep.
pub fn fix_security_footguns(paths: &Paths, pairing: &dyn PairingStore) -> SecurityFixResult {
    let mut result = SecurityFixResult {
        ok: true,
        state_dir: paths.state_dir().to_path_buf(),
        config_path: paths.config_path().to_path_buf(),
        config_written: false,
        changes: Vec::new(),
        actions: Vec::new(),
        errors: Vec::new(),
    };

    let snapshot = Config::load(paths);
    if !snapshot.is_valid() {
        result.errors.extend(
            snapshot
                .issues
                .iter()
                .map(|issue| format!("config: {issue}")),
        );
    } else if let Some(mut raw) = snapshot.raw.clone() {
        result.changes = apply_config_fixes(&mut raw, pairing);
        if !result.changes.is_empty() {
            match write_config(&snapshot.path, &raw) {
                Ok(()) => result.config_written = true,
                Err(error) => {
                    tracing::error!(%error, "failed to write hardened config");
                    result.errors.push(error.to_string());
                }
            }
        }
    }

    result.actions = harden_permissions(paths, &snapshot.config);
    result.errors.extend(
        result
            .actions
            .iter()
            .filter_map(|action| match &action.outcome {
                PermissionOutcome::Error { message } => {
                    Some(format!("chmod {} {}: {message}", action.mode, action.path.display()))
                }
                _ => None,
            }),
    );
    result.ok = result.errors.is_empty();

    tracing::info!(
        ok = result.ok,
        changes = result.changes.len(),
        config_written = result.config_written,
        actions = result.actions.len(),
        errors = result.errors.len(),
        "security sweep finished"
    );

    result
}

fn write_config(path: &std::path::Path, raw: &Value) -> std::result::Result<(), SecurityError> {
    // A rename would replace the link with a regular file.
    if std::fs::symlink_metadata(path).is_ok_and(|metadata| metadata.file_type().is_symlink()) {
        return Err(SecurityError::ConfigSymlink {
            path: path.to_path_buf(),
        });
    }
    let mut data = serde_json::to_vec_pretty(raw)
        .map_err(|error| SecurityError::Other(anyhow::Error::new(error)))?;
    data.push(b'\n');
    write_atomic(path, &data, FileMode::OwnerOnly).map_err(|source| SecurityError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Flip risky settings in the root config document. Returns one line per
/// change. Settings that only arrive through `$include` are left to the
/// audit to report.
fn apply_config_fixes(raw: &mut Value, pairing: &dyn PairingStore) -> Vec<String> {
    let mut changes = Vec::new();
    let Some(root) = raw.as_object_mut() else {
        return changes;
    };

    if let Some(logging) = root.get_mut("logging").and_then(Value::as_object_mut)
        && logging.get("redactSensitive").and_then(Value::as_str) == Some("off")
    {
        logging.insert("redactSensitive".into(), Value::from("tools"));
        changes.push("logging.redactSensitive=off -> \"tools\"".into());
    }

    let Some(channels) = root.get_mut("channels").and_then(Value::as_object_mut) else {
        return changes;
    };
    for (channel, channel_value) in channels.iter_mut() {
        if channel == INCLUDE_KEY {
            continue;
        }
        let Some(channel_config) = channel_value.as_object_mut() else {
            continue;
        };
        let pairable = supports_pairing(channel);
        let prefix = format!("channels.{channel}");

        if flip_open_policy(channel_config, &prefix, &mut changes) && pairable {
            backfill_allow_from(channel_config, channel, pairing, &prefix, &mut changes);
        }
        let channel_has_list = has_allow_list(channel_config);

        let Some(accounts) = channel_config
            .get_mut("accounts")
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        for (account, account_value) in accounts.iter_mut() {
            let Some(account_config) = account_value.as_object_mut() else {
                continue;
            };
            let prefix = format!("{prefix}.accounts.{account}");
            if flip_open_policy(account_config, &prefix, &mut changes)
                && pairable
                && !channel_has_list
            {
                backfill_allow_from(account_config, channel, pairing, &prefix, &mut changes);
            }
        }
    }

    changes
}

fn flip_open_policy(scope: &mut Map<String, Value>, prefix: &str, changes: &mut Vec<String>) -> bool {
    if scope.get("groupPolicy").and_then(Value::as_str) != Some("open") {
        return false;
    }
    scope.insert("groupPolicy".into(), Value::from("allowlist"));
    changes.push(format!("{prefix}.groupPolicy=open -> \"allowlist\""));
    true
}

fn has_allow_list(scope: &Map<String, Value>) -> bool {
    scope
        .get("groupAllowFrom")
        .and_then(Value::as_array)
        .is_some_and(|list| !list.is_empty())
}

fn backfill_allow_from(
    scope: &mut Map<String, Value>,
    channel: &str,
    pairing: &dyn PairingStore,
    prefix: &str,
    changes: &mut Vec<String>,
) {
    if has_allow_list(scope) {
        return;
    }
    let senders = match pairing.read_allow_from(channel) {
        Ok(senders) => senders,
        Err(error) => {
            tracing::warn!(%error, channel, "failed to read pairing store, not backfilling");
            return;
        }
    };
    if senders.is_empty() {
        return;
    }
    let count = senders.len();
    scope.insert(
        "groupAllowFrom".into(),
        Value::Array(senders.into_iter().map(Value::from).collect()),
    );
    changes.push(format!(
        "{prefix}.groupAllowFrom: backfilled {count} sender(s) from pairing store"
    ));
}

fn harden_permissions(paths: &Paths, config: &Config) -> Vec<PermissionAction> {
    let mut actions = vec![
        tighten(paths.state_dir(), EntryKind::Dir, OWNER_ONLY_DIR),
        tighten(paths.config_path(), EntryKind::File, OWNER_ONLY_FILE),
    ];

    for include in collect_include_paths(paths.config_path()) {
        actions.push(tighten(&include, EntryKind::File, OWNER_ONLY_FILE));
    }

    tighten_credentials_dir(paths.oauth_dir(), &mut actions);

    // The default agent plus every listed one.
    for agent_id in config.agent_ids() {
        let agent_dir = config.resolve_agent_dir(paths, &agent_id);
        actions.push(tighten(&paths.agent_root(&agent_id), EntryKind::Dir, OWNER_ONLY_DIR));
        actions.push(tighten(&agent_dir, EntryKind::Dir, OWNER_ONLY_DIR));
        actions.push(tighten(&paths.sessions_dir(&agent_id), EntryKind::Dir, OWNER_ONLY_DIR));
        actions.push(tighten(
            &crate::auth_profiles::auth_profiles_path(&agent_dir),
            EntryKind::File,
            OWNER_ONLY_FILE,
        ));
        actions.push(tighten(
            &paths.session_store_path(&agent_id),
            EntryKind::File,
            OWNER_ONLY_FILE,
        ));
    }

    actions
}
