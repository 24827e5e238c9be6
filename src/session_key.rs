//! Session key canonicalization.
//!
//! Every conversation maps to one canonical key of the form
//! `agent:<agentId>:<scope>[:<localId>]`. Canonicalization is idempotent and
//! folds every spelling of an agent's main session (`main`, the configured
//! main-key alias, `agent:<id>:main`, `agent:<id>:<mainKey>`) into
//! `agent:<id>:main` before anything mode-sensitive looks at the key.

use crate::config::{Config, DmScope};

use serde::{Deserialize, Serialize};

pub const DEFAULT_AGENT_ID: &str = "main";
pub const DEFAULT_MAIN_KEY: &str = "main";
pub const DEFAULT_ACCOUNT_ID: &str = "default";

const AGENT_PREFIX: &str = "agent:";
const MAIN_SCOPE: &str = "main";
const SUBAGENT_SCOPE: &str = "subagent";
const MAX_AGENT_ID_LEN: usize = 64;

/// Normalize an agent id to `[a-z0-9_-]{1,64}`; empty input maps to `main`.
pub fn normalize_agent_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_AGENT_ID_LEN).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        truncated.to_string()
    }
}

fn normalize_segment(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed
    }
}

/// A canonical session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn agent_id(&self) -> &str {
        self.parts().0
    }

    /// First segment after the agent id (`main`, `dm`, `group`, `subagent`, ...).
    pub fn scope(&self) -> &str {
        self.parts().1
    }

    /// Everything after the scope segment; empty for main sessions.
    pub fn local_id(&self) -> &str {
        self.parts().2
    }

    fn parts(&self) -> (&str, &str, &str) {
        let rest = self.0.strip_prefix(AGENT_PREFIX).unwrap_or(&self.0);
        let (agent, remainder) = rest.split_once(':').unwrap_or((rest, ""));
        let (scope, local) = remainder.split_once(':').unwrap_or((remainder, ""));
        (agent, scope, local)
    }

    fn from_parts(agent_id: &str, remainder: &str) -> Self {
        Self(format!("{AGENT_PREFIX}{agent_id}:{remainder}"))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Classification used by sandboxing and bootstrap-file selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Main,
    /// Delegated, short-lived session spawned by another session.
    Subagent,
    Other,
}

/// Kind of conversation a peer session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Direct,
    Group,
    Channel,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Direct => "dm",
            PeerKind::Group => "group",
            PeerKind::Channel => "channel",
        }
    }
}

impl std::str::FromStr for PeerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dm" | "direct" => Ok(PeerKind::Direct),
            "group" => Ok(PeerKind::Group),
            "channel" => Ok(PeerKind::Channel),
            other => Err(format!(
                "invalid peer kind: '{other}', expected 'dm', 'group' or 'channel'"
            )),
        }
    }
}

/// Builds and canonicalizes session keys for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyResolver {
    default_agent_id: String,
    main_key: String,
}

impl Default for SessionKeyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_ID, DEFAULT_MAIN_KEY)
    }
}

impl SessionKeyResolver {
    pub fn new(default_agent_id: &str, main_key: &str) -> Self {
        Self {
            default_agent_id: normalize_agent_id(default_agent_id),
            main_key: normalize_segment(main_key, DEFAULT_MAIN_KEY),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.default_agent_id(), config.main_key())
    }

    pub fn default_agent_id(&self) -> &str {
        &self.default_agent_id
    }

    fn is_main_alias(&self, value: &str) -> bool {
        value.is_empty() || value == MAIN_SCOPE || value == self.main_key
    }

    /// Canonical form of any raw key. Keys without the `agent:` prefix are
    /// scoped under the default agent.
    pub fn canonicalize(&self, raw: &str) -> SessionKey {
        let lowered = raw.trim().to_lowercase();

        let Some(rest) = lowered.strip_prefix(AGENT_PREFIX) else {
            let local = lowered.trim_matches(':');
            if self.is_main_alias(local) {
                return self.main_session(&self.default_agent_id);
            }
            return SessionKey::from_parts(&self.default_agent_id, local);
        };

        let (agent, remainder) = rest.split_once(':').unwrap_or((rest, ""));
        let agent = normalize_agent_id(agent);
        let remainder = remainder.trim_matches(':');
        if self.is_main_alias(remainder) {
            return self.main_session(&agent);
        }
        SessionKey::from_parts(&agent, remainder)
    }

    /// Classify a raw or canonical key.
    pub fn classify(&self, raw: &str) -> SessionKind {
        let key = self.canonicalize(raw);
        match key.scope() {
            MAIN_SCOPE if key.local_id().is_empty() => SessionKind::Main,
            SUBAGENT_SCOPE => SessionKind::Subagent,
            _ => SessionKind::Other,
        }
    }

    pub fn is_main(&self, raw: &str) -> bool {
        self.classify(raw) == SessionKind::Main
    }

    pub fn is_subagent(&self, raw: &str) -> bool {
        self.classify(raw) == SessionKind::Subagent
    }

    pub fn main_session(&self, agent_id: &str) -> SessionKey {
        SessionKey::from_parts(&normalize_agent_id(agent_id), MAIN_SCOPE)
    }

    /// Key for a conversation with a peer on a channel account.
    ///
    /// With [`DmScope::Main`], direct messages collapse into the agent's main
    /// session; groups and channels always get their own key.
    pub fn peer_session(
        &self,
        agent_id: &str,
        channel: &str,
        account_id: Option<&str>,
        kind: PeerKind,
        peer_id: &str,
        dm_scope: DmScope,
    ) -> SessionKey {
        if kind == PeerKind::Direct && dm_scope == DmScope::Main {
            return self.main_session(agent_id);
        }
        let channel = normalize_segment(channel, "unknown");
        let account = normalize_segment(account_id.unwrap_or_default(), DEFAULT_ACCOUNT_ID);
        let peer = normalize_segment(peer_id, "unknown");
        SessionKey::from_parts(
            &normalize_agent_id(agent_id),
            &format!("{}:{channel}:{account}:{peer}", kind.as_str()),
        )
    }

    pub fn subagent_session(&self, agent_id: &str, label: &str) -> SessionKey {
        let label = normalize_segment(label, "task");
        SessionKey::from_parts(
            &normalize_agent_id(agent_id),
            &format!("{SUBAGENT_SCOPE}:{label}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_agent_id() {
        assert_eq!(normalize_agent_id("Ops Team!"), "ops-team");
        assert_eq!(normalize_agent_id("  "), "main");
        assert_eq!(normalize_agent_id("--a--b--"), "a-b");
        let long = "x".repeat(100);
        assert_eq!(normalize_agent_id(&long).len(), 64);
    }

    #[test]
    fn main_aliases_collapse_to_one_key() {
        let resolver = SessionKeyResolver::new("ops", "home");
        let expected = SessionKey::from_parts("ops", "main");
        for raw in ["main", "MAIN", "home", " Home ", "agent:ops:main", "agent:OPS:home", ""] {
            assert_eq!(resolver.canonicalize(raw), expected, "raw key {raw:?}");
            assert!(resolver.is_main(raw), "raw key {raw:?} should be main");
        }
    }

    #[test]
    fn every_agent_has_its_own_main() {
        let resolver = SessionKeyResolver::default();
        assert_eq!(resolver.canonicalize("agent:research:main").as_str(), "agent:research:main");
        assert!(resolver.is_main("agent:research:main"));
        assert_eq!(resolver.canonicalize("agent:research").as_str(), "agent:research:main");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let resolver = SessionKeyResolver::new("ops", "home");
        let samples = [
            "main",
            "home",
            "agent:ops:home",
            "Agent:Ops:DM:Telegram:Default:42",
            "group:slack:c123",
            "agent::main",
            "agent:weird name:subagent:Task",
            "agent",
            ":::",
        ];
        for raw in samples {
            let once = resolver.canonicalize(raw);
            let twice = resolver.canonicalize(once.as_str());
            assert_eq!(once, twice, "raw key {raw:?}");
        }
    }

    #[test]
    fn bare_keys_are_scoped_to_default_agent() {
        let resolver = SessionKeyResolver::new("ops", "main");
        let key = resolver.canonicalize("group:slack:c123");
        assert_eq!(key.as_str(), "agent:ops:group:slack:c123");
        assert_eq!(key.agent_id(), "ops");
        assert_eq!(key.scope(), "group");
        assert_eq!(key.local_id(), "slack:c123");
        assert_eq!(resolver.classify(key.as_str()), SessionKind::Other);
    }

    #[test]
    fn subagent_keys_are_classified() {
        let resolver = SessionKeyResolver::default();
        let key = resolver.subagent_session("main", "Summarize");
        assert_eq!(key.as_str(), "agent:main:subagent:summarize");
        assert!(resolver.is_subagent(key.as_str()));
        assert!(!resolver.is_subagent("agent:main:dm:telegram:default:subagent"));
    }

    #[test]
    fn direct_messages_follow_dm_scope() {
        let resolver = SessionKeyResolver::default();
        let collapsed =
            resolver.peer_session("main", "telegram", None, PeerKind::Direct, "42", DmScope::Main);
        assert_eq!(collapsed.as_str(), "agent:main:main");

        let per_peer = resolver.peer_session(
            "main",
            "Telegram",
            Some("Biz"),
            PeerKind::Direct,
            "42",
            DmScope::PerPeer,
        );
        assert_eq!(per_peer.as_str(), "agent:main:dm:telegram:biz:42");

        let group = resolver.peer_session(
            "main",
            "whatsapp",
            None,
            PeerKind::Group,
            "1203@g.us",
            DmScope::Main,
        );
        assert_eq!(group.as_str(), "agent:main:group:whatsapp:default:1203@g.us");
        assert_eq!(resolver.canonicalize(group.as_str()), group);
    }
}
