//! Credential files owned by other command-line tools.
//!
//! Each integration is one row in [`EXTERNAL_INTEGRATIONS`]: where the file
//! lives and how to read it. Adding a tool means adding a row.

use crate::paths::Paths;

use anyhow::Context as _;
use serde::Deserialize;

use std::path::PathBuf;

pub const CLAUDE_CLI_PROFILE_ID: &str = "anthropic:claude-cli";
pub const CODEX_CLI_PROFILE_ID: &str = "openai-codex:codex-cli";

/// A credential as found in an external tool's file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCredential {
    pub access: String,
    pub refresh: Option<String>,
    /// Expiry in Unix milliseconds, when the tool records one.
    pub expires: Option<i64>,
}

/// Outcome of reading one integration's file.
#[derive(Debug)]
pub enum ExternalRead {
    Missing,
    Malformed(anyhow::Error),
    Found(ExternalCredential),
}

pub struct ExternalIntegration {
    /// Reserved profile id the credential is synced into.
    pub profile_id: &'static str,
    pub provider: &'static str,
    pub path: fn(&Paths) -> PathBuf,
    pub parse: fn(&[u8]) -> anyhow::Result<ExternalCredential>,
}

impl std::fmt::Debug for ExternalIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalIntegration")
            .field("profile_id", &self.profile_id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl ExternalIntegration {
    pub fn read(&self, paths: &Paths) -> ExternalRead {
        let path = (self.path)(paths);
        let bytes = match crate::fs_util::read_optional(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return ExternalRead::Missing,
            Err(error) => {
                return ExternalRead::Malformed(
                    anyhow::Error::new(error).context(format!("failed to read {}", path.display())),
                );
            }
        };
        match (self.parse)(&bytes) {
            Ok(credential) => ExternalRead::Found(credential),
            Err(error) => ExternalRead::Malformed(error.context(format!("in {}", path.display()))),
        }
    }
}

pub static EXTERNAL_INTEGRATIONS: &[ExternalIntegration] = &[
    ExternalIntegration {
        profile_id: CLAUDE_CLI_PROFILE_ID,
        provider: "anthropic",
        path: claude_cli_path,
        parse: parse_claude_cli,
    },
    ExternalIntegration {
        profile_id: CODEX_CLI_PROFILE_ID,
        provider: "openai-codex",
        path: codex_cli_path,
        parse: parse_codex_cli,
    },
];

/// Integration owning a reserved profile id.
pub fn integration_for(profile_id: &str) -> Option<&'static ExternalIntegration> {
    EXTERNAL_INTEGRATIONS
        .iter()
        .find(|integration| integration.profile_id == profile_id)
}

fn claude_cli_path(paths: &Paths) -> PathBuf {
    paths.home_dir().join(".claude").join(".credentials.json")
}

fn codex_cli_path(paths: &Paths) -> PathBuf {
    paths.codex_home().join("auth.json")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeCliFile {
    #[serde(alias = "oauth")]
    claude_ai_oauth: Option<ClaudeCliOAuth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeCliOAuth {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
}

fn parse_claude_cli(bytes: &[u8]) -> anyhow::Result<ExternalCredential> {
    let file: ClaudeCliFile =
        serde_json::from_slice(bytes).context("invalid Claude CLI credentials")?;
    let oauth = file
        .claude_ai_oauth
        .context("Claude CLI credentials carry no oauth section")?;
    credential(oauth.access_token, oauth.refresh_token, oauth.expires_at)
}

#[derive(Deserialize)]
struct CodexCliFile {
    tokens: Option<CodexCliTokens>,
}

#[derive(Deserialize)]
struct CodexCliTokens {
    access_token: String,
    refresh_token: Option<String>,
}

fn parse_codex_cli(bytes: &[u8]) -> anyhow::Result<ExternalCredential> {
    let file: CodexCliFile = serde_json::from_slice(bytes).context("invalid Codex CLI auth file")?;
    let tokens = file
        .tokens
        .context("Codex CLI auth file carries no tokens (API key login?)")?;
    credential(tokens.access_token, tokens.refresh_token, None)
}

fn credential(
    access: String,
    refresh: Option<String>,
    expires: Option<i64>,
) -> anyhow::Result<ExternalCredential> {
    let access = access.trim().to_string();
    if access.is_empty() {
        anyhow::bail!("access token is empty");
    }
    let refresh = refresh
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    Ok(ExternalCredential {
        access,
        refresh,
        expires,
    })
}
