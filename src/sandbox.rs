//! Per-session sandbox boundary resolution.
//!
//! Resolution is pure: it decides whether a session runs isolated and where
//! its filesystem root lives. Launching the isolated process is someone
//! else's job.

use crate::config::{Config, SandboxSettings};
use crate::error::{Result, WorkspaceError};
use crate::paths::Paths;
use crate::session_key::{SessionKeyResolver, normalize_agent_id};
use crate::workspace::seed_bootstrap_files_from;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use std::path::{Path, PathBuf};

/// When sessions get sandboxed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    #[serde(alias = "none")]
    Off,
    All,
    /// Everything except the agent's main session.
    NonMain,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::Off => "off",
            SandboxMode::All => "all",
            SandboxMode::NonMain => "non-main",
        }
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(SandboxMode::Off),
            "all" => Ok(SandboxMode::All),
            "non-main" => Ok(SandboxMode::NonMain),
            other => Err(format!(
                "invalid sandbox mode: '{other}', expected 'off', 'all' or 'non-main'"
            )),
        }
    }
}

/// How many sessions share one boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxScope {
    #[default]
    Session,
    Agent,
}

/// What the sandbox may do with the agent's own workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    #[default]
    None,
    Ro,
    Rw,
}

/// Where and how one session is isolated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub workspace_root: PathBuf,
    /// The boundary's own directory under `workspace_root`.
    pub workspace_dir: PathBuf,
    /// Agent workspace the sandbox is seeded from.
    pub agent_workspace_dir: PathBuf,
    pub scope_key: String,
    pub workspace_access: WorkspaceAccess,
}

/// Agent settings field by field over `agents.defaults.sandbox`.
fn effective_settings(config: &Config, agent_id: &str) -> SandboxSettings {
    let defaults = config.agents.defaults.sandbox.clone().unwrap_or_default();
    let Some(agent) = config.agent(agent_id).and_then(|a| a.sandbox.clone()) else {
        return defaults;
    };
    SandboxSettings {
        mode: agent.mode.or(defaults.mode),
        scope: agent.scope.or(defaults.scope),
        workspace_root: agent.workspace_root.or(defaults.workspace_root),
        workspace_access: agent.workspace_access.or(defaults.workspace_access),
    }
}

/// Filesystem-safe directory name for a scope key. The digest suffix keeps
/// keys that slug to the same text apart.
fn scope_slug(scope_key: &str) -> String {
    let mut slug = String::with_capacity(scope_key.len());
    for c in scope_key.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c.to_ascii_lowercase()
        } else {
            '-'
        };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    let slug: String = slug.trim_matches('-').chars().take(48).collect();
    let digest = hex::encode(Sha256::digest(scope_key.as_bytes()));
    format!("{}-{}", slug.trim_end_matches('-'), &digest[..8])
}

/// Decide the sandbox for `session_key`, or `None` to run unsandboxed.
///
/// `agent_workspace_dir` is the workspace the session would use without a
/// sandbox. Main-session aliases are folded before the `non-main`
/// exemption applies.
pub fn resolve_sandbox_context(
    config: &Config,
    paths: &Paths,
    session_key: &str,
    agent_workspace_dir: &Path,
) -> Option<SandboxContext> {
    let resolver = SessionKeyResolver::from_config(config);
    let key = resolver.canonicalize(session_key);
    let agent_id = normalize_agent_id(key.agent_id());
    let settings = effective_settings(config, &agent_id);

    let mode = settings.mode.unwrap_or_default();
    match mode {
        SandboxMode::Off => return None,
        SandboxMode::NonMain if resolver.is_main(key.as_str()) => return None,
        SandboxMode::NonMain | SandboxMode::All => {}
    }

    let scope = settings.scope.unwrap_or_default();
    let scope_key = match scope {
        SandboxScope::Session => key.as_str().to_string(),
        SandboxScope::Agent => format!("agent:{agent_id}"),
    };
    let workspace_root = settings
        .workspace_root
        .unwrap_or_else(|| paths.sandboxes_dir());
    let workspace_dir = workspace_root.join(scope_slug(&scope_key));

    Some(SandboxContext {
        mode,
        scope,
        workspace_root,
        workspace_dir,
        agent_workspace_dir: agent_workspace_dir.to_path_buf(),
        scope_key,
        workspace_access: settings.workspace_access.unwrap_or_default(),
    })
}

/// Resolve the context and materialize its directory, seeded with the
/// agent's bootstrap files. Exempt sessions get `None` and touch nothing.
pub async fn ensure_sandbox_workspace_for_session(
    config: &Config,
    paths: &Paths,
    session_key: &str,
    agent_workspace_dir: &Path,
) -> Result<Option<SandboxContext>> {
    let Some(context) = resolve_sandbox_context(config, paths, session_key, agent_workspace_dir)
    else {
        return Ok(None);
    };

    tokio::fs::create_dir_all(&context.workspace_root)
        .await
        .map_err(|source| WorkspaceError::CreateDir {
            path: context.workspace_root.clone(),
            source,
        })?;
    let created =
        seed_bootstrap_files_from(&context.agent_workspace_dir, &context.workspace_dir).await?;

    tracing::debug!(
        scope_key = %context.scope_key,
        dir = %context.workspace_dir.display(),
        seeded = created.len(),
        "sandbox workspace ready"
    );

    Ok(Some(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{AGENTS_FILENAME, BOOTSTRAP_FILENAME};

    fn test_paths(root: &Path) -> Paths {
        let state = root.join("state");
        Paths::resolve(root.join("home"), root.to_path_buf(), move |name| {
            (name == crate::paths::STATE_DIR_ENV).then(|| state.to_string_lossy().to_string())
        })
    }

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).expect("config")
    }

    fn non_main(scope: &str) -> Config {
        config(serde_json::json!({
            "session": { "mainKey": "home" },
            "agents": {
                "defaults": { "sandbox": { "mode": "non-main", "scope": scope } },
                "list": [ { "id": "ops", "default": true } ]
            }
        }))
    }

    #[test]
    fn mode_accepts_none_alias() {
        let settings: SandboxSettings =
            serde_json::from_value(serde_json::json!({ "mode": "none" })).expect("settings");
        assert_eq!(settings.mode, Some(SandboxMode::Off));
        assert_eq!("NON-MAIN".parse::<SandboxMode>(), Ok(SandboxMode::NonMain));
        assert!("sometimes".parse::<SandboxMode>().is_err());
    }

    #[tokio::test]
    async fn main_session_aliases_are_exempt_under_non_main() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let workspace = dir.path().join("ws");

        for scope in ["session", "agent"] {
            let config = non_main(scope);
            for key in ["main", "home", "agent:ops:main", "AGENT:OPS:HOME", ""] {
                assert!(
                    resolve_sandbox_context(&config, &paths, key, &workspace).is_none(),
                    "scope {scope} key {key:?}"
                );
                let ensured = ensure_sandbox_workspace_for_session(&config, &paths, key, &workspace)
                    .await
                    .expect("ensure");
                assert!(ensured.is_none(), "scope {scope} key {key:?}");
            }
        }
        assert!(!paths.sandboxes_dir().exists(), "nothing may be materialized");
    }

    #[test]
    fn non_main_sessions_are_sandboxed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let config = non_main("session");

        let context = resolve_sandbox_context(
            &config,
            &paths,
            "agent:ops:group:slack:default:c1",
            dir.path(),
        )
        .expect("group session is sandboxed");
        assert_eq!(context.mode, SandboxMode::NonMain);
        assert_eq!(context.scope_key, "agent:ops:group:slack:default:c1");
        assert_eq!(context.workspace_root, paths.sandboxes_dir());
        assert!(context.workspace_dir.starts_with(paths.sandboxes_dir()));
        assert_eq!(context.workspace_access, WorkspaceAccess::None);
    }

    #[test]
    fn agent_scope_shares_one_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let config = non_main("agent");

        let a = resolve_sandbox_context(&config, &paths, "agent:ops:dm:telegram:default:1", dir.path())
            .expect("sandboxed");
        let b = resolve_sandbox_context(&config, &paths, "agent:ops:subagent:task", dir.path())
            .expect("sandboxed");
        assert_eq!(a.scope_key, "agent:ops");
        assert_eq!(a.workspace_dir, b.workspace_dir);
    }

    #[test]
    fn agent_settings_override_defaults_per_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let config = config(serde_json::json!({
            "agents": {
                "defaults": { "sandbox": { "mode": "all", "workspaceAccess": "ro" } },
                "list": [
                    { "id": "main", "default": true },
                    { "id": "free", "sandbox": { "mode": "off" } },
                    { "id": "boxed", "sandbox": { "scope": "agent", "workspaceRoot": "/srv/boxes" } }
                ]
            }
        }));

        assert!(resolve_sandbox_context(&config, &paths, "agent:free:main", dir.path()).is_none());

        let main = resolve_sandbox_context(&config, &paths, "main", dir.path())
            .expect("mode all sandboxes main too");
        assert_eq!(main.workspace_access, WorkspaceAccess::Ro);

        let boxed = resolve_sandbox_context(&config, &paths, "agent:boxed:main", dir.path())
            .expect("inherits mode all");
        assert_eq!(boxed.scope, SandboxScope::Agent);
        assert_eq!(boxed.workspace_root, PathBuf::from("/srv/boxes"));
        assert_eq!(boxed.workspace_access, WorkspaceAccess::Ro);
    }

    #[test]
    fn slugs_differ_for_colliding_keys() {
        assert_ne!(scope_slug("agent:a:b"), scope_slug("agent:a-b"));
        assert!(scope_slug("agent:ops:dm:x").starts_with("agent-ops-dm-x-"));
    }

    #[tokio::test]
    async fn sandbox_workspace_is_seeded_without_onboarding_note() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = test_paths(dir.path());
        let config = config(serde_json::json!({
            "agents": { "defaults": { "sandbox": { "mode": "all" } } }
        }));
        let workspace = dir.path().join("ws");
        tokio::fs::create_dir_all(&workspace).await.expect("mkdir");
        tokio::fs::write(workspace.join(AGENTS_FILENAME), "agent rules")
            .await
            .expect("write");

        let context = ensure_sandbox_workspace_for_session(&config, &paths, "main", &workspace)
            .await
            .expect("ensure")
            .expect("sandboxed");
        let agents = tokio::fs::read_to_string(context.workspace_dir.join(AGENTS_FILENAME))
            .await
            .expect("seeded");
        assert_eq!(agents, "agent rules");
        assert!(!context.workspace_dir.join(BOOTSTRAP_FILENAME).exists());
        assert!(!context.workspace_dir.join(".git").exists());
    }
}
