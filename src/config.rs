//! Configuration loading and validation.
//!
//! The config file is JSON that tolerates `//` and `/* */` comments, trailing
//! commas and `$include` directives. Loading never fails hard on schema
//! problems: they are collected as [`ConfigIssue`]s on the returned
//! [`ConfigSnapshot`] so callers can decide how strict to be.

use crate::error::ConfigError;
use crate::paths::Paths;
use crate::sandbox::{SandboxMode, SandboxScope, WorkspaceAccess};
use crate::session_key::{DEFAULT_AGENT_ID, normalize_agent_id};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Key that pulls other files into the object it appears in.
pub const INCLUDE_KEY: &str = "$include";
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub list: Vec<AgentConfig>,
}

/// Settings inherited by every agent that does not override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    pub workspace: Option<PathBuf>,
    pub sandbox: Option<SandboxSettings>,
    pub human_delay: Option<HumanDelay>,
}

/// One configured agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub default: bool,
    pub name: Option<String>,
    pub workspace: Option<PathBuf>,
    pub agent_dir: Option<PathBuf>,
    pub sandbox: Option<SandboxSettings>,
    pub human_delay: Option<HumanDelay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    pub mode: Option<SandboxMode>,
    pub scope: Option<SandboxScope>,
    pub workspace_root: Option<PathBuf>,
    pub workspace_access: Option<WorkspaceAccess>,
}

/// Artificial reply pacing. Consumed by the delivery layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanDelay {
    pub mode: Option<String>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// Direct messages share the agent's main session.
    #[default]
    Main,
    /// Each direct-message peer gets its own session.
    PerPeer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub main_key: Option<String>,
    pub dm_scope: Option<DmScope>,
}

/// Routes inbound traffic matching `match` to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub agent_id: String,
    #[serde(rename = "match")]
    pub match_rule: BindingMatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingMatch {
    pub channel: String,
    pub account_id: Option<String>,
    pub peer: Option<PeerMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMatch {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub port: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactSensitive {
    Off,
    Tools,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// Also write a daily rolling log under `<state>/logs`.
    pub file: Option<bool>,
    pub redact_sensitive: Option<RedactSensitive>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    #[serde(default)]
    pub load: PluginLoadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLoadConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// Channel-wide group admission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicyMode {
    Open,
    Allowlist,
    Disabled,
}

/// Per-channel settings. Adapter-specific keys are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub group_policy: Option<GroupPolicyMode>,
    #[serde(default, deserialize_with = "string_list")]
    pub group_allow_from: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    #[serde(default)]
    pub accounts: BTreeMap<String, ChannelAccountConfig>,
    pub auth_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccountConfig {
    pub group_policy: Option<GroupPolicyMode>,
    #[serde(default, deserialize_with = "string_list")]
    pub group_allow_from: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    pub auth_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub require_mention: Option<bool>,
    pub tools: Option<ToolPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Sender ids show up as both strings and bare numbers (Telegram).
fn string_list<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    use serde::de::Error;

    let values: Vec<Value> = Vec::deserialize(d)?;
    values
        .into_iter()
        .map(|value| match value {
            Value::String(text) => Ok(text),
            Value::Number(number) => Ok(number.to_string()),
            other => Err(Error::custom(format!(
                "expected string or number, got {other}"
            ))),
        })
        .collect()
}

/// A problem found while loading or validating the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Result of reading the config file.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    pub exists: bool,
    /// Root file content with comments stripped, before include resolution.
    /// This is what gets edited and written back.
    pub raw: Option<Value>,
    pub config: Config,
    pub issues: Vec<ConfigIssue>,
}

impl ConfigSnapshot {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Config {
    /// Load the config at `paths.config_path()`.
    pub fn load(paths: &Paths) -> ConfigSnapshot {
        Self::load_from_path(paths, paths.config_path())
    }

    /// Load from an explicit path. Never fails: I/O and schema problems end
    /// up in `issues` and the returned config falls back to defaults.
    pub fn load_from_path(paths: &Paths, path: &Path) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot {
            path: path.to_path_buf(),
            exists: false,
            raw: None,
            config: Config::default(),
            issues: Vec::new(),
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return snapshot,
            Err(error) => {
                snapshot.exists = true;
                snapshot.issues.push(issue(
                    "",
                    ConfigError::Load {
                        path: path.to_path_buf(),
                        source: error,
                    },
                ));
                return snapshot;
            }
        };
        snapshot.exists = true;

        let raw = match parse_json_with_comments(&text) {
            Ok(raw) => raw,
            Err(error) => {
                snapshot.issues.push(issue(
                    "",
                    ConfigError::Parse {
                        path: path.to_path_buf(),
                        message: error.to_string(),
                    },
                ));
                return snapshot;
            }
        };
        snapshot.raw = Some(raw.clone());

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut visited = HashSet::from([canonical_or_self(path)]);
        let resolved = match resolve_includes(raw, base_dir, &mut visited, 0) {
            Ok(resolved) => resolved,
            Err(error) => {
                snapshot.issues.push(issue(INCLUDE_KEY, error));
                return snapshot;
            }
        };

        match Config::deserialize(&resolved) {
            Ok(mut config) => {
                snapshot.issues.extend(config.validate());
                config.normalize_paths(paths);
                snapshot.config = config;
            }
            Err(error) => {
                snapshot.issues.push(ConfigIssue {
                    path: String::new(),
                    message: format!("schema violation: {error}"),
                });
                // Keep the agent list reachable for filesystem work.
                snapshot.config.agents.list = salvage_agents(&resolved);
                snapshot.config.normalize_paths(paths);
            }
        }

        snapshot
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let mut seen_ids = HashSet::new();
        let mut default_count = 0;
        for (index, agent) in self.agents.list.iter().enumerate() {
            if agent.id.trim().is_empty() {
                issues.push(ConfigIssue {
                    path: format!("agents.list[{index}].id"),
                    message: "agent id must not be empty".into(),
                });
                continue;
            }
            if !seen_ids.insert(normalize_agent_id(&agent.id)) {
                issues.push(ConfigIssue {
                    path: format!("agents.list[{index}].id"),
                    message: format!("duplicate agent id '{}'", agent.id),
                });
            }
            if agent.default {
                default_count += 1;
            }
        }
        if default_count > 1 {
            issues.push(ConfigIssue {
                path: "agents.list".into(),
                message: "more than one agent is marked default".into(),
            });
        }

        for (channel, channel_config) in &self.channels {
            let mut folded: HashMap<String, &str> = HashMap::new();
            for account_id in channel_config.accounts.keys() {
                let key = account_id.trim().to_lowercase();
                if let Some(previous) = folded.insert(key, account_id) {
                    issues.push(ConfigIssue {
                        path: format!("channels.{channel}.accounts"),
                        message: format!(
                            "account ids '{previous}' and '{account_id}' differ only by case"
                        ),
                    });
                }
            }
        }

        for (index, binding) in self.bindings.iter().enumerate() {
            if binding.match_rule.channel.trim().is_empty() {
                issues.push(ConfigIssue {
                    path: format!("bindings[{index}].match.channel"),
                    message: "binding channel must not be empty".into(),
                });
            }
        }

        issues
    }

    /// Expand `~` once for every path-shaped field so consumers never have to.
    pub fn normalize_paths(&mut self, paths: &Paths) {
        let fix = |value: &mut PathBuf| {
            *value = paths.resolve_user_path(&value.to_string_lossy());
        };
        let fix_sandbox = |sandbox: &mut Option<SandboxSettings>| {
            if let Some(root) = sandbox.as_mut().and_then(|s| s.workspace_root.as_mut()) {
                fix(root);
            }
        };

        if let Some(workspace) = self.agents.defaults.workspace.as_mut() {
            fix(workspace);
        }
        fix_sandbox(&mut self.agents.defaults.sandbox);
        for agent in &mut self.agents.list {
            if let Some(workspace) = agent.workspace.as_mut() {
                fix(workspace);
            }
            if let Some(agent_dir) = agent.agent_dir.as_mut() {
                fix(agent_dir);
            }
            fix_sandbox(&mut agent.sandbox);
        }
        for plugin_path in &mut self.plugins.load.paths {
            fix(plugin_path);
        }
        for channel in self.channels.values_mut() {
            if let Some(auth_dir) = channel.auth_dir.as_mut() {
                fix(auth_dir);
            }
            for account in channel.accounts.values_mut() {
                if let Some(auth_dir) = account.auth_dir.as_mut() {
                    fix(auth_dir);
                }
            }
        }
    }

    /// The agent that handles traffic nothing else claims.
    pub fn default_agent_id(&self) -> String {
        self.agents
            .list
            .iter()
            .find(|agent| agent.default)
            .or_else(|| self.agents.list.first())
            .map(|agent| normalize_agent_id(&agent.id))
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string())
    }

    /// Default agent first, then every listed agent, without duplicates.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids = vec![self.default_agent_id()];
        for agent in &self.agents.list {
            let id = normalize_agent_id(&agent.id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        let wanted = normalize_agent_id(agent_id);
        self.agents
            .list
            .iter()
            .find(|agent| normalize_agent_id(&agent.id) == wanted)
    }

    pub fn main_key(&self) -> &str {
        self.session
            .main_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(crate::session_key::DEFAULT_MAIN_KEY)
    }

    /// Directory holding the agent's credential profiles.
    pub fn resolve_agent_dir(&self, paths: &Paths, agent_id: &str) -> PathBuf {
        let agent_id = normalize_agent_id(agent_id);
        if let Some(dir) = self.agent(&agent_id).and_then(|a| a.agent_dir.clone()) {
            return dir;
        }
        if agent_id == self.default_agent_id()
            && let Some(dir) = paths.agent_dir_override()
        {
            return dir.to_path_buf();
        }
        paths.default_agent_dir(&agent_id)
    }

    pub fn resolve_agent_workspace(&self, paths: &Paths, agent_id: &str) -> PathBuf {
        let agent_id = normalize_agent_id(agent_id);
        if let Some(dir) = self.agent(&agent_id).and_then(|a| a.workspace.clone()) {
            return dir;
        }
        let is_default = agent_id == self.default_agent_id();
        if is_default && let Some(dir) = self.agents.defaults.workspace.clone() {
            return dir;
        }
        paths.default_workspace_dir(&agent_id, is_default)
    }

    /// Channel lookup by case-insensitive name.
    pub fn channel(&self, channel: &str) -> Option<&ChannelConfig> {
        let wanted = channel.trim().to_lowercase();
        self.channels.get(&wanted).or_else(|| {
            self.channels
                .iter()
                .find(|(name, _)| name.to_lowercase() == wanted)
                .map(|(_, config)| config)
        })
    }
}

/// Agents recovered from a document that failed schema checks. Entries that
/// do not deserialize keep only their id, default flag and directories.
fn salvage_agents(resolved: &Value) -> Vec<AgentConfig> {
    let Some(list) = resolved.pointer("/agents/list").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|entry| {
            if let Ok(agent) = AgentConfig::deserialize(entry) {
                return Some(agent);
            }
            let id = entry.get("id").and_then(Value::as_str)?;
            let path = |key: &str| entry.get(key).and_then(Value::as_str).map(PathBuf::from);
            Some(AgentConfig {
                id: id.to_string(),
                default: entry.get("default").and_then(Value::as_bool).unwrap_or(false),
                workspace: path("workspace"),
                agent_dir: path("agentDir"),
                ..AgentConfig::default()
            })
        })
        .collect()
}

fn issue(path: &str, error: ConfigError) -> ConfigIssue {
    ConfigIssue {
        path: path.to_string(),
        message: error.to_string(),
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Parse JSON that may contain comments and trailing commas.
pub fn parse_json_with_comments(input: &str) -> serde_json::Result<Value> {
    serde_json::from_str(&strip_trailing_commas(&strip_json_comments(input)))
}

fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }

        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    chars.next();
                    for n in chars.by_ref() {
                        if n == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for n in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        if n == '\n' {
                            out.push('\n');
                        }
                        prev = n;
                    }
                    continue;
                }
                _ => {}
            }
        }

        out.push(c);
    }

    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;

    for (index, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[index + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

fn include_targets(value: &Value) -> Vec<String> {
    match value {
        Value::String(path) => vec![path.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn read_include(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    parse_json_with_comments(&text).map_err(|error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

/// Replace every `$include` with the merged content of the referenced files.
/// Sibling keys win over included ones.
fn resolve_includes(
    value: Value,
    base_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: usize,
) -> Result<Value, ConfigError> {
    match value {
        Value::Object(mut object) => {
            let include = object.remove(INCLUDE_KEY);
            let mut resolved = Map::new();
            for (key, child) in object {
                resolved.insert(key, resolve_includes(child, base_dir, visited, depth)?);
            }
            let Some(include) = include else {
                return Ok(Value::Object(resolved));
            };

            let mut merged = Value::Object(Map::new());
            for target in include_targets(&include) {
                let path = base_dir.join(&target);
                if depth + 1 > MAX_INCLUDE_DEPTH {
                    return Err(ConfigError::IncludeDepth {
                        path,
                        max: MAX_INCLUDE_DEPTH,
                    });
                }
                let canonical = canonical_or_self(&path);
                if !visited.insert(canonical.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "include cycle detected at {}",
                        path.display()
                    )));
                }
                let included = read_include(&path)?;
                let child_dir = path.parent().unwrap_or(base_dir).to_path_buf();
                let included = resolve_includes(included, &child_dir, visited, depth + 1)?;
                visited.remove(&canonical);
                deep_merge(&mut merged, included);
            }
            deep_merge(&mut merged, Value::Object(resolved));
            Ok(merged)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| resolve_includes(item, base_dir, visited, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Every file reachable from `root` through `$include`, excluding `root`.
///
/// Traversal is cycle-safe and stops descending at [`MAX_INCLUDE_DEPTH`].
/// Unreadable files are still reported (the caller may want to harden them)
/// but are not descended into.
pub fn collect_include_paths(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut visited = HashSet::from([canonical_or_self(root)]);
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    while let Some((path, depth)) = stack.pop() {
        if depth >= MAX_INCLUDE_DEPTH {
            continue;
        }
        let Ok(value) = read_include(&path) else {
            continue;
        };
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let mut targets = Vec::new();
        gather_include_targets(&value, &mut targets);
        for target in targets {
            let child = base_dir.join(target);
            if visited.insert(canonical_or_self(&child)) {
                found.push(child.clone());
                stack.push((child, depth + 1));
            }
        }
    }

    found
}

fn gather_include_targets(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(object) => {
            for (key, child) in object {
                if key == INCLUDE_KEY {
                    out.extend(include_targets(child));
                } else {
                    gather_include_targets(child, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| gather_include_targets(item, out)),
        _ => {}
    }
}
