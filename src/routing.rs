//! Inbound message routing: which agent, which session.

use crate::config::{BindingConfig, Config};
use crate::session_key::{
    DEFAULT_ACCOUNT_ID, PeerKind, SessionKey, SessionKeyResolver, normalize_agent_id,
};

use serde::Serialize;

/// The routing-relevant part of an inbound event.
#[derive(Debug, Clone)]
pub struct InboundPeer {
    pub channel: String,
    pub account_id: Option<String>,
    pub peer_kind: PeerKind,
    /// Sender for direct messages, group/channel id otherwise.
    pub peer_id: String,
}

/// Which rule selected the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Default,
    Channel,
    Account,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRoute {
    pub agent_id: String,
    pub account_id: String,
    pub session_key: SessionKey,
    pub matched_by: MatchedBy,
}

fn binding_specificity(binding: &BindingConfig, inbound: &InboundPeer) -> Option<MatchedBy> {
    let rule = &binding.match_rule;
    if !rule.channel.trim().eq_ignore_ascii_case(inbound.channel.trim()) {
        return None;
    }

    let inbound_account = inbound
        .account_id
        .as_deref()
        .unwrap_or(DEFAULT_ACCOUNT_ID)
        .trim();
    let account_specific = match rule.account_id.as_deref().map(str::trim) {
        None | Some("*") => false,
        Some(account) if account.eq_ignore_ascii_case(inbound_account) => true,
        Some(_) => return None,
    };

    if let Some(peer) = &rule.peer {
        let kind_matches = peer
            .kind
            .parse::<PeerKind>()
            .is_ok_and(|kind| kind == inbound.peer_kind);
        if !kind_matches || peer.id.trim() != inbound.peer_id.trim() {
            return None;
        }
        return Some(MatchedBy::Peer);
    }

    Some(if account_specific {
        MatchedBy::Account
    } else {
        MatchedBy::Channel
    })
}

/// Pick the agent for `inbound` and build its canonical session key.
///
/// The most specific binding wins (peer, then account, then channel); ties go
/// to the binding listed first. Bindings naming an agent that is not
/// configured are ignored.
pub fn resolve_agent_route(
    config: &Config,
    resolver: &SessionKeyResolver,
    inbound: &InboundPeer,
) -> AgentRoute {
    let known_agents = config.agent_ids();
    let mut best: Option<(MatchedBy, String)> = None;

    for binding in &config.bindings {
        let Some(specificity) = binding_specificity(binding, inbound) else {
            continue;
        };
        let agent_id = normalize_agent_id(&binding.agent_id);
        if !config.agents.list.is_empty() && !known_agents.contains(&agent_id) {
            tracing::warn!(
                agent_id = %binding.agent_id,
                channel = %binding.match_rule.channel,
                "binding references an unknown agent, ignoring"
            );
            continue;
        }
        if best.as_ref().is_none_or(|(current, _)| specificity > *current) {
            best = Some((specificity, agent_id));
        }
    }

    let (matched_by, agent_id) =
        best.unwrap_or_else(|| (MatchedBy::Default, resolver.default_agent_id().to_string()));

    let account_id = inbound
        .account_id
        .as_deref()
        .map(str::trim)
        .filter(|account| !account.is_empty())
        .unwrap_or(DEFAULT_ACCOUNT_ID)
        .to_lowercase();

    let session_key = resolver.peer_session(
        &agent_id,
        &inbound.channel,
        Some(&account_id),
        inbound.peer_kind,
        &inbound.peer_id,
        config.session.dm_scope.unwrap_or_default(),
    );

    AgentRoute {
        agent_id,
        account_id,
        session_key,
        matched_by,
    }
}
