//! Group chat admission, mention and tool policy.
//!
//! Group maps live at `channels.<channel>.groups` and
//! `channels.<channel>.accounts.<account>.groups`. A non-empty map turns on
//! allowlisting for that scope; the `"*"` entry allows every group and
//! supplies defaults for groups without their own entry.

use crate::config::{ChannelAccountConfig, ChannelConfig, Config, GroupConfig, GroupPolicyMode, ToolPolicy};

use serde::Serialize;
use std::collections::BTreeMap;

pub const WILDCARD_GROUP: &str = "*";

/// What to resolve a group policy for.
#[derive(Debug, Clone, Copy)]
pub struct GroupPolicyQuery<'a> {
    pub config: &'a Config,
    pub channel: &'a str,
    pub account_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
}

/// Resolved group policy for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGroupPolicy {
    pub allowlist_enabled: bool,
    pub allowed: bool,
    pub group_config: Option<GroupConfig>,
    pub default_config: Option<GroupConfig>,
}

/// Whether an explicit per-call override beats configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MentionPrecedence {
    #[default]
    OverrideFirst,
    ConfigFirst,
}

/// Outcome of the combined admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum GroupAccess {
    Allowed,
    Denied(String),
}

/// Account lookup: exact id first, then a case-insensitive match. When the
/// case-insensitive match is ambiguous nothing is returned; config
/// validation reports such collisions.
fn find_account<'a>(
    channel: &'a ChannelConfig,
    account_id: Option<&str>,
) -> Option<&'a ChannelAccountConfig> {
    let account_id = account_id.map(str::trim).filter(|id| !id.is_empty())?;
    if let Some(account) = channel.accounts.get(account_id) {
        return Some(account);
    }
    let folded = account_id.to_lowercase();
    let mut matches = channel
        .accounts
        .iter()
        .filter(|(key, _)| key.trim().to_lowercase() == folded);
    let first = matches.next();
    if matches.next().is_some() {
        tracing::warn!(
            account_id,
            "account id matches several configured accounts case-insensitively, ignoring"
        );
        return None;
    }
    first.map(|(_, account)| account)
}

fn groups_map<'a>(query: &GroupPolicyQuery<'a>) -> Option<&'a BTreeMap<String, GroupConfig>> {
    let channel = query.config.channel(query.channel)?;
    find_account(channel, query.account_id)
        .map(|account| &account.groups)
        .filter(|groups| !groups.is_empty())
        .or(Some(&channel.groups))
}

pub fn resolve_channel_group_policy(query: &GroupPolicyQuery<'_>) -> ChannelGroupPolicy {
    let groups = groups_map(query).filter(|groups| !groups.is_empty());
    let Some(groups) = groups else {
        return ChannelGroupPolicy {
            allowlist_enabled: false,
            allowed: true,
            group_config: None,
            default_config: None,
        };
    };

    let default_config = groups.get(WILDCARD_GROUP).cloned();
    let group_config = query
        .group_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .and_then(|id| groups.get(id))
        .cloned();
    let allowed = default_config.is_some() || group_config.is_some();

    ChannelGroupPolicy {
        allowlist_enabled: true,
        allowed,
        group_config,
        default_config,
    }
}

/// Mention requirement: override, group entry, wildcard entry, then `true`.
/// With [`MentionPrecedence::ConfigFirst`] the override moves after config.
pub fn resolve_require_mention(
    query: &GroupPolicyQuery<'_>,
    override_value: Option<bool>,
    precedence: MentionPrecedence,
) -> bool {
    let policy = resolve_channel_group_policy(query);
    let from_config = policy
        .group_config
        .as_ref()
        .and_then(|config| config.require_mention)
        .or_else(|| {
            policy
                .default_config
                .as_ref()
                .and_then(|config| config.require_mention)
        });

    let resolved = match precedence {
        MentionPrecedence::OverrideFirst => override_value.or(from_config),
        MentionPrecedence::ConfigFirst => from_config.or(override_value),
    };
    resolved.unwrap_or(true)
}

/// Tool policy for the group, or `None` so the caller applies its default.
pub fn resolve_tools_policy(query: &GroupPolicyQuery<'_>) -> Option<ToolPolicy> {
    let policy = resolve_channel_group_policy(query);
    policy
        .group_config
        .and_then(|config| config.tools)
        .or_else(|| policy.default_config.and_then(|config| config.tools))
}

/// Full admission check for a group message from `sender_id`.
///
/// `groupPolicy` (account over channel, default `allowlist`) decides whether
/// senders are filtered; the group map decides whether the group itself is
/// admitted.
pub fn evaluate_group_access(query: &GroupPolicyQuery<'_>, sender_id: &str) -> GroupAccess {
    let Some(channel) = query.config.channel(query.channel) else {
        return GroupAccess::Denied("channel_not_configured".into());
    };
    let account = find_account(channel, query.account_id);

    let mode = account
        .and_then(|account| account.group_policy)
        .or(channel.group_policy)
        .unwrap_or(GroupPolicyMode::Allowlist);
    if mode == GroupPolicyMode::Disabled {
        return GroupAccess::Denied("group_policy_disabled".into());
    }

    if !resolve_channel_group_policy(query).allowed {
        return GroupAccess::Denied("group_not_allowlisted".into());
    }

    if mode == GroupPolicyMode::Open {
        return GroupAccess::Allowed;
    }

    let senders = account
        .map(|account| &account.group_allow_from)
        .filter(|list| !list.is_empty())
        .or(Some(&channel.group_allow_from).filter(|list| !list.is_empty()))
        .unwrap_or(&channel.allow_from);
    let sender = sender_id.trim();
    let permitted = senders
        .iter()
        .map(|entry| entry.trim())
        .any(|entry| entry == WILDCARD_GROUP || entry.eq_ignore_ascii_case(sender));

    if permitted {
        GroupAccess::Allowed
    } else {
        GroupAccess::Denied("sender_not_allowlisted".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).expect("config")
    }

    fn query<'a>(config: &'a Config, account: Option<&'a str>, group: &'a str) -> GroupPolicyQuery<'a> {
        GroupPolicyQuery {
            config,
            channel: "telegram",
            account_id: account,
            group_id: Some(group),
        }
    }

    #[test]
    fn wildcard_allows_unlisted_groups_with_defaults() {
        let config = config(serde_json::json!({
            "channels": { "telegram": { "groups": { "*": { "requireMention": false } } } }
        }));
        let q = query(&config, None, "-100999");
        let policy = resolve_channel_group_policy(&q);
        assert!(policy.allowlist_enabled);
        assert!(policy.allowed);
        assert!(policy.group_config.is_none());
        assert!(!resolve_require_mention(&q, None, MentionPrecedence::OverrideFirst));
    }

    #[test]
    fn explicit_map_without_wildcard_denies_unlisted() {
        let config = config(serde_json::json!({
            "channels": { "telegram": { "groups": { "specific-id": { "requireMention": true } } } }
        }));
        let policy = resolve_channel_group_policy(&query(&config, None, "other"));
        assert!(policy.allowlist_enabled);
        assert!(!policy.allowed);

        let policy = resolve_channel_group_policy(&query(&config, None, "specific-id"));
        assert!(policy.allowed);
    }

    #[test]
    fn no_group_map_allows_everything() {
        let config = config(serde_json::json!({ "channels": { "telegram": {} } }));
        let policy = resolve_channel_group_policy(&query(&config, None, "anything"));
        assert!(!policy.allowlist_enabled);
        assert!(policy.allowed);

        let empty = Config::default();
        let policy = resolve_channel_group_policy(&query(&empty, None, "anything"));
        assert!(!policy.allowlist_enabled);
        assert!(policy.allowed);
    }

    #[test]
    fn account_map_preferred_with_case_insensitive_fallback() {
        let config = config(serde_json::json!({
            "channels": { "telegram": {
                "groups": { "*": {} },
                "accounts": { "Biz": { "groups": { "g1": { "tools": { "allow": ["read"] } } } } }
            } }
        }));
        let policy = resolve_channel_group_policy(&query(&config, Some("biz"), "g2"));
        assert!(!policy.allowed, "account map has no wildcard");

        let tools = resolve_tools_policy(&query(&config, Some("BIZ"), "g1"));
        assert_eq!(tools.map(|t| t.allow), Some(vec!["read".to_string()]));

        let policy = resolve_channel_group_policy(&query(&config, Some("other"), "g2"));
        assert!(policy.allowed, "unknown account uses the channel map");
    }

    #[test]
    fn mention_precedence_orders_override() {
        let config = config(serde_json::json!({
            "channels": { "telegram": { "groups": { "g1": { "requireMention": false } } } }
        }));
        let q = query(&config, None, "g1");
        assert!(resolve_require_mention(&q, Some(true), MentionPrecedence::OverrideFirst));
        assert!(!resolve_require_mention(&q, Some(true), MentionPrecedence::ConfigFirst));

        let bare = Config::default();
        let q = query(&bare, None, "g1");
        assert!(resolve_require_mention(&q, None, MentionPrecedence::ConfigFirst));
        assert!(!resolve_require_mention(&q, Some(false), MentionPrecedence::ConfigFirst));
    }

    #[test]
    fn tools_policy_falls_back_to_wildcard_then_none() {
        let config = config(serde_json::json!({
            "channels": { "telegram": { "groups": {
                "*": { "tools": { "deny": ["exec"] } },
                "g1": { "requireMention": true }
            } } }
        }));
        let tools = resolve_tools_policy(&query(&config, None, "g1"));
        assert_eq!(tools.map(|t| t.deny), Some(vec!["exec".to_string()]));

        let bare = config_without_tools();
        assert!(resolve_tools_policy(&query(&bare, None, "g1")).is_none());
    }

    fn config_without_tools() -> Config {
        config(serde_json::json!({
            "channels": { "telegram": { "groups": { "g1": { "requireMention": true } } } }
        }))
    }

    #[test]
    fn allowlist_mode_filters_senders() {
        let config = config(serde_json::json!({
            "channels": { "telegram": {
                "groupPolicy": "allowlist",
                "groupAllowFrom": ["alice", 42]
            } }
        }));
        assert_eq!(evaluate_group_access(&query(&config, None, "g"), "ALICE"), GroupAccess::Allowed);
        assert_eq!(evaluate_group_access(&query(&config, None, "g"), "42"), GroupAccess::Allowed);
        assert_eq!(
            evaluate_group_access(&query(&config, None, "g"), "mallory"),
            GroupAccess::Denied("sender_not_allowlisted".into())
        );
    }

    #[test]
    fn disabled_and_open_modes() {
        let config = config(serde_json::json!({
            "channels": { "telegram": {
                "groupPolicy": "open",
                "accounts": { "quiet": { "groupPolicy": "disabled" } }
            } }
        }));
        assert_eq!(evaluate_group_access(&query(&config, None, "g"), "anyone"), GroupAccess::Allowed);
        assert_eq!(
            evaluate_group_access(&query(&config, Some("quiet"), "g"), "anyone"),
            GroupAccess::Denied("group_policy_disabled".into())
        );
    }
}
