//! Filesystem layout and environment overrides.
//!
//! A single [`Paths`] value is resolved at process start and handed to every
//! component. Nothing in the crate reads these environment variables after
//! that point, so tests construct `Paths` from a fixed lookup instead of
//! mutating the process environment.

use anyhow::Context as _;
use std::path::{Path, PathBuf};

pub const STATE_DIR_ENV: &str = "EPILOOP_STATE_DIR";
pub const CONFIG_PATH_ENV: &str = "EPILOOP_CONFIG_PATH";
pub const OAUTH_DIR_ENV: &str = "EPILOOP_OAUTH_DIR";
pub const GATEWAY_PORT_ENV: &str = "EPILOOP_GATEWAY_PORT";
pub const NIX_MODE_ENV: &str = "EPILOOP_NIX_MODE";
pub const AGENT_DIR_ENV: &str = "EPILOOP_AGENT_DIR";
/// Older name for [`AGENT_DIR_ENV`], still honored.
pub const LEGACY_AGENT_DIR_ENV: &str = "PI_CODING_AGENT_DIR";
pub const CODEX_HOME_ENV: &str = "CODEX_HOME";

pub const STATE_DIR_NAME: &str = ".epiloop";
pub const CONFIG_FILE_NAME: &str = "epiloop.json";
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Resolved filesystem layout for one gateway process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home_dir: PathBuf,
    cwd: PathBuf,
    state_dir: PathBuf,
    config_path: PathBuf,
    oauth_dir: PathBuf,
    codex_home: PathBuf,
    agent_dir_override: Option<PathBuf>,
    gateway_port_override: Option<u16>,
    managed_mode: bool,
}

impl Paths {
    /// Resolve from the real process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let home_dir = dirs::home_dir().context("could not determine home directory")?;
        let cwd = std::env::current_dir().context("could not determine current directory")?;
        Ok(Self::resolve(home_dir, cwd, |name| std::env::var(name).ok()))
    }

    /// Resolve from an arbitrary variable lookup.
    pub fn resolve(
        home_dir: PathBuf,
        cwd: PathBuf,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let state_dir = match var(STATE_DIR_ENV) {
            Some(raw) => resolve_user_path_with(&home_dir, &cwd, &raw),
            None => home_dir.join(STATE_DIR_NAME),
        };
        let config_path = match var(CONFIG_PATH_ENV) {
            Some(raw) => resolve_user_path_with(&home_dir, &cwd, &raw),
            None => state_dir.join(CONFIG_FILE_NAME),
        };
        let oauth_dir = match var(OAUTH_DIR_ENV) {
            Some(raw) => resolve_user_path_with(&home_dir, &cwd, &raw),
            None => state_dir.join("credentials"),
        };
        let codex_home = match var(CODEX_HOME_ENV) {
            Some(raw) => resolve_user_path_with(&home_dir, &cwd, &raw),
            None => home_dir.join(".codex"),
        };
        let agent_dir_override = var(AGENT_DIR_ENV)
            .or_else(|| var(LEGACY_AGENT_DIR_ENV))
            .map(|raw| resolve_user_path_with(&home_dir, &cwd, &raw));
        let gateway_port_override = var(GATEWAY_PORT_ENV).and_then(|raw| parse_port(&raw));
        let managed_mode = var(NIX_MODE_ENV).as_deref() == Some("1");

        Self {
            home_dir,
            cwd,
            state_dir,
            config_path,
            oauth_dir,
            codex_home,
            agent_dir_override,
            gateway_port_override,
            managed_mode,
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory holding channel credentials and pairing stores.
    pub fn oauth_dir(&self) -> &Path {
        &self.oauth_dir
    }

    pub fn codex_home(&self) -> &Path {
        &self.codex_home
    }

    pub fn agent_dir_override(&self) -> Option<&Path> {
        self.agent_dir_override.as_deref()
    }

    /// True when the install is managed externally (Nix) and the config file
    /// must be treated as read-only by interactive tooling.
    pub fn is_managed_mode(&self) -> bool {
        self.managed_mode
    }

    /// Gateway port: environment override, then config, then the default.
    pub fn gateway_port(&self, config_port: Option<i64>) -> u16 {
        self.gateway_port_override
            .or_else(|| {
                config_port
                    .filter(|port| *port > 0)
                    .and_then(|port| u16::try_from(port).ok())
            })
            .unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    /// Expand a leading `~` against the home directory.
    pub fn expand_tilde(&self, raw: &str) -> PathBuf {
        expand_tilde_with(&self.home_dir, raw)
    }

    /// Expand `~` and absolutize against the working directory.
    pub fn resolve_user_path(&self, raw: &str) -> PathBuf {
        resolve_user_path_with(&self.home_dir, &self.cwd, raw)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.state_dir.join("agents")
    }

    /// Per-agent root: `<state>/agents/<id>`.
    pub fn agent_root(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    /// Default credential directory for an agent when the config sets none.
    pub fn default_agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_root(agent_id).join("agent")
    }

    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_root(agent_id).join("sessions")
    }

    pub fn session_store_path(&self, agent_id: &str) -> PathBuf {
        self.sessions_dir(agent_id).join("sessions.json")
    }

    /// Default workspace: the default agent gets `<state>/workspace`, every
    /// other agent `<state>/workspace-<id>`.
    pub fn default_workspace_dir(&self, agent_id: &str, is_default_agent: bool) -> PathBuf {
        if is_default_agent {
            self.state_dir.join("workspace")
        } else {
            self.state_dir.join(format!("workspace-{agent_id}"))
        }
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.state_dir.join("sandboxes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

fn expand_tilde_with(home: &Path, raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = trimmed
        .strip_prefix("~/")
        .or_else(|| trimmed.strip_prefix("~\\"))
    {
        return home.join(rest);
    }
    PathBuf::from(trimmed)
}

fn resolve_user_path_with(home: &Path, cwd: &Path, raw: &str) -> PathBuf {
    let expanded = expand_tilde_with(home, raw);
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn paths_with(vars: &[(&str, &str)]) -> Paths {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Paths::resolve(
            PathBuf::from("/home/tester"),
            PathBuf::from("/srv/work"),
            move |name| vars.get(name).cloned(),
        )
    }

    #[test]
    fn defaults_live_under_home() {
        let paths = paths_with(&[]);
        assert_eq!(paths.state_dir(), Path::new("/home/tester/.epiloop"));
        assert_eq!(
            paths.config_path(),
            Path::new("/home/tester/.epiloop/epiloop.json")
        );
        assert_eq!(
            paths.oauth_dir(),
            Path::new("/home/tester/.epiloop/credentials")
        );
        assert!(!paths.is_managed_mode());
        assert!(paths.agent_dir_override().is_none());
    }

    #[test]
    fn state_dir_override_moves_config_path() {
        let paths = paths_with(&[(STATE_DIR_ENV, "/tmp/epi-state")]);
        assert_eq!(paths.state_dir(), Path::new("/tmp/epi-state"));
        assert_eq!(
            paths.config_path(),
            Path::new("/tmp/epi-state/epiloop.json")
        );
    }

    #[test]
    fn relative_state_dir_is_absolutized() {
        let paths = paths_with(&[(STATE_DIR_ENV, "state")]);
        assert_eq!(paths.state_dir(), Path::new("/srv/work/state"));
    }

    #[test]
    fn config_path_override_expands_tilde_against_home() {
        let paths = paths_with(&[(CONFIG_PATH_ENV, "~/configs/epi.json")]);
        assert_eq!(
            paths.config_path(),
            Path::new("/home/tester/configs/epi.json")
        );
    }

    #[test]
    fn gateway_port_prefers_env_then_config_then_default() {
        let paths = paths_with(&[(GATEWAY_PORT_ENV, "19001")]);
        assert_eq!(paths.gateway_port(Some(20000)), 19001);

        let paths = paths_with(&[(GATEWAY_PORT_ENV, "not-a-port")]);
        assert_eq!(paths.gateway_port(Some(20000)), 20000);
        assert_eq!(paths.gateway_port(Some(0)), DEFAULT_GATEWAY_PORT);
        assert_eq!(paths.gateway_port(Some(-5)), DEFAULT_GATEWAY_PORT);
        assert_eq!(paths.gateway_port(None), DEFAULT_GATEWAY_PORT);
    }

    #[test]
    fn managed_mode_requires_literal_one() {
        assert!(paths_with(&[(NIX_MODE_ENV, "1")]).is_managed_mode());
        assert!(!paths_with(&[(NIX_MODE_ENV, "true")]).is_managed_mode());
    }

    #[test]
    fn legacy_agent_dir_env_is_recognized() {
        let paths = paths_with(&[(LEGACY_AGENT_DIR_ENV, "~/agent")]);
        assert_eq!(
            paths.agent_dir_override(),
            Some(Path::new("/home/tester/agent"))
        );

        let paths = paths_with(&[
            (LEGACY_AGENT_DIR_ENV, "/legacy"),
            (AGENT_DIR_ENV, "/current"),
        ]);
        assert_eq!(paths.agent_dir_override(), Some(Path::new("/current")));
    }

    #[test]
    fn expand_tilde_leaves_other_paths_alone() {
        let paths = paths_with(&[]);
        assert_eq!(paths.expand_tilde("~"), PathBuf::from("/home/tester"));
        assert_eq!(paths.expand_tilde("/abs/~x"), PathBuf::from("/abs/~x"));
        assert_eq!(paths.expand_tilde("~other"), PathBuf::from("~other"));
    }
}
