//! Read-only security audit. Reports what the sweep would fix, plus
//! settings it never changes on its own.

use crate::config::{Config, GroupPolicyMode, RedactSensitive, collect_include_paths};
use crate::paths::Paths;

use serde::Serialize;

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warn,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warn => "warn",
            AuditSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFinding {
    pub check_id: String,
    pub severity: AuditSeverity,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub critical: usize,
    pub warn: usize,
    pub info: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityAuditReport {
    pub findings: Vec<AuditFinding>,
    pub summary: AuditSummary,
}

impl SecurityAuditReport {
    fn push(
        &mut self,
        check_id: &str,
        severity: AuditSeverity,
        title: &str,
        detail: String,
        remediation: Option<&str>,
    ) {
        match severity {
            AuditSeverity::Critical => self.summary.critical += 1,
            AuditSeverity::Warn => self.summary.warn += 1,
            AuditSeverity::Info => self.summary.info += 1,
        }
        self.findings.push(AuditFinding {
            check_id: check_id.to_string(),
            severity,
            title: title.to_string(),
            detail,
            remediation: remediation.map(str::to_string),
        });
    }
}

const FIX_HINT: &str = "run `epiloop security audit --fix`";

/// Inspect configuration and on-disk state. `deep` also walks include files
/// and every agent's credential and session files.
pub fn audit_security(paths: &Paths, deep: bool) -> SecurityAuditReport {
    let mut report = SecurityAuditReport::default();
    let snapshot = Config::load(paths);

    if !paths.state_dir().exists() {
        report.push(
            "fs.state_dir.missing",
            AuditSeverity::Info,
            "State directory does not exist yet",
            paths.state_dir().display().to_string(),
            None,
        );
    }
    check_mode(&mut report, "fs.state_dir.perms", paths.state_dir(), true);
    check_mode(&mut report, "fs.config.perms", paths.config_path(), false);
    check_mode(&mut report, "fs.credentials_dir.perms", paths.oauth_dir(), true);

    for issue in &snapshot.issues {
        report.push(
            "config.invalid",
            AuditSeverity::Warn,
            "Config has problems; automatic config fixes are skipped",
            issue.to_string(),
            Some("fix the reported config problem and re-run the audit"),
        );
    }

    let config = &snapshot.config;
    if config.logging.redact_sensitive == Some(RedactSensitive::Off) {
        report.push(
            "logging.redact_off",
            AuditSeverity::Warn,
            "Sensitive tool output is not redacted in logs",
            "logging.redactSensitive is \"off\"".into(),
            Some(FIX_HINT),
        );
    }
    check_group_policies(&mut report, config);

    if paths.is_managed_mode() {
        report.push(
            "config.managed_mode",
            AuditSeverity::Info,
            "Config is managed externally",
            "config edits made by --fix may be overwritten by the next deploy".into(),
            None,
        );
    }

    if deep {
        for include in collect_include_paths(paths.config_path()) {
            check_mode(&mut report, "fs.config_include.perms", &include, false);
        }
        for agent_id in config.agent_ids() {
            let agent_dir = config.resolve_agent_dir(paths, &agent_id);
            check_mode(
                &mut report,
                "fs.auth_profiles.perms",
                &crate::auth_profiles::auth_profiles_path(&agent_dir),
                false,
            );
            check_mode(
                &mut report,
                "fs.sessions.perms",
                &paths.session_store_path(&agent_id),
                false,
            );
        }
    }

    report
        .findings
        .sort_by(|a, b| b.severity.cmp(&a.severity).then(a.check_id.cmp(&b.check_id)));
    report
}

fn check_group_policies(report: &mut SecurityAuditReport, config: &Config) {
    for (channel, channel_config) in &config.channels {
        if channel_config.group_policy == Some(GroupPolicyMode::Open) {
            report.push(
                "channels.group_policy_open",
                AuditSeverity::Critical,
                "Any group member can talk to the agent",
                format!("channels.{channel}.groupPolicy is \"open\""),
                Some(FIX_HINT),
            );
        }
        for (account, account_config) in &channel_config.accounts {
            if account_config.group_policy == Some(GroupPolicyMode::Open) {
                report.push(
                    "channels.group_policy_open",
                    AuditSeverity::Critical,
                    "Any group member can talk to the agent",
                    format!("channels.{channel}.accounts.{account}.groupPolicy is \"open\""),
                    Some(FIX_HINT),
                );
            }
        }
    }
}

#[cfg(unix)]
fn check_mode(report: &mut SecurityAuditReport, check_id: &str, path: &Path, is_dir: bool) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };
    if metadata.file_type().is_symlink() {
        report.push(
            check_id,
            AuditSeverity::Warn,
            "Path is a symlink; permissions are not managed",
            path.display().to_string(),
            Some("replace the symlink with a real file or directory"),
        );
        return;
    }

    let mode = metadata.permissions().mode() & 0o777;
    let (severity, who) = if mode & 0o007 != 0 {
        (AuditSeverity::Critical, "other users")
    } else if mode & 0o070 != 0 {
        (AuditSeverity::Warn, "the owning group")
    } else {
        return;
    };
    let kind = if is_dir { "Directory" } else { "File" };
    report.push(
        check_id,
        severity,
        &format!("{kind} is accessible by {who}"),
        format!("{} has mode {mode:03o}", path.display()),
        Some(FIX_HINT),
    );
}

#[cfg(not(unix))]
fn check_mode(_report: &mut SecurityAuditReport, _check_id: &str, _path: &Path, _is_dir: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(root: &Path) -> Paths {
        let state = root.join("state");
        Paths::resolve(root.join("home"), root.to_path_buf(), move |name| match name {
            crate::paths::STATE_DIR_ENV => Some(state.to_string_lossy().to_string()),
            crate::paths::NIX_MODE_ENV => Some("1".into()),
            _ => None,
        })
    }

    #[test]
    fn reports_risky_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        std::fs::create_dir_all(paths.state_dir()).expect("mkdir");
        std::fs::write(
            paths.config_path(),
            r#"{ "logging": { "redactSensitive": "off" },
                 "channels": { "slack": { "groupPolicy": "open", "accounts": { "a": { "groupPolicy": "open" } } } } }"#,
        )
        .expect("write");

        let report = audit_security(&paths, false);
        let ids: Vec<_> = report.findings.iter().map(|f| f.check_id.as_str()).collect();
        assert_eq!(
            ids.iter().filter(|id| **id == "channels.group_policy_open").count(),
            2
        );
        assert!(ids.contains(&"logging.redact_off"));
        assert!(ids.contains(&"config.managed_mode"));
        assert_eq!(report.findings[0].severity, AuditSeverity::Critical);
    }

    #[cfg(unix)]
    #[test]
    fn deep_audit_flags_loose_credential_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let agent_dir = paths.default_agent_dir("main");
        std::fs::create_dir_all(&agent_dir).expect("mkdir");
        let store = crate::auth_profiles::auth_profiles_path(&agent_dir);
        std::fs::write(&store, "{}").expect("write");
        std::fs::set_permissions(&store, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let shallow = audit_security(&paths, false);
        assert!(!shallow.findings.iter().any(|f| f.check_id == "fs.auth_profiles.perms"));

        let deep = audit_security(&paths, true);
        let finding = deep
            .findings
            .iter()
            .find(|f| f.check_id == "fs.auth_profiles.perms")
            .expect("loose store reported");
        assert_eq!(finding.severity, AuditSeverity::Critical);
    }
}
