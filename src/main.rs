//! Epiloop operator CLI.

use epiloop::auth_profiles::AuthProfiles;
use epiloop::config::Config;
use epiloop::logging::{LoggingSettings, init_tracing};
use epiloop::pairing::FilePairingStore;
use epiloop::paths::Paths;
use epiloop::security::{PermissionOutcome, SecurityAuditReport, SecurityFixResult, SkipReason};
use epiloop::session_key::normalize_agent_id;
use epiloop::workspace::{EnsureWorkspaceOptions, WorkspaceManager};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "epiloop")]
#[command(about = "Identity, session and credential tooling for the epiloop gateway")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit and harden config and on-disk state
    Security {
        #[command(subcommand)]
        command: SecurityCommand,
    },
    /// Show resolved state, config and credential locations
    Paths {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Model-provider credential profiles
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Agent workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
}

#[derive(Subcommand)]
enum SecurityCommand {
    /// Report risky settings and loose permissions
    Audit {
        /// Apply safe fixes before auditing
        #[arg(long)]
        fix: bool,
        /// Also inspect include files and per-agent credential files
        #[arg(long)]
        deep: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Reconcile credentials from external CLI tools into the profile store
    Sync {
        /// Only this agent (default: every configured agent)
        #[arg(long)]
        agent: Option<String>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    /// Create an agent workspace and its bootstrap files
    Init {
        /// Agent id (default: the default agent)
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = Paths::from_env()?;
    let snapshot = Config::load(&paths);
    let _log_guard = init_tracing(
        cli.debug,
        &LoggingSettings::from_config(&snapshot.config.logging, &paths),
    );
    for issue in &snapshot.issues {
        tracing::warn!(%issue, path = %snapshot.path.display(), "config problem");
    }
    let config = snapshot.config;

    match cli.command {
        Command::Security {
            command: SecurityCommand::Audit { fix, deep, json },
        } => {
            let fix_result = fix.then(|| {
                epiloop::fix_security_footguns(&paths, &FilePairingStore::new(&paths))
            });
            let report = epiloop::audit_security(&paths, deep);
            if json {
                let output = serde_json::json!({ "fix": fix_result, "report": report });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                if let Some(result) = &fix_result {
                    print_fix_result(result);
                }
                print_audit_report(&report);
            }
            if fix_result.is_some_and(|result| !result.ok) {
                anyhow::bail!("security fixes finished with errors");
            }
        }
        Command::Paths { json } => {
            let agents: Vec<_> = config
                .agent_ids()
                .into_iter()
                .map(|agent_id| {
                    serde_json::json!({
                        "id": agent_id,
                        "agentDir": config.resolve_agent_dir(&paths, &agent_id),
                        "workspace": config.resolve_agent_workspace(&paths, &agent_id),
                        "sessionStore": paths.session_store_path(&agent_id),
                    })
                })
                .collect();
            let output = serde_json::json!({
                "stateDir": paths.state_dir(),
                "configPath": paths.config_path(),
                "oauthDir": paths.oauth_dir(),
                "gatewayPort": paths.gateway_port(config.gateway.port),
                "managedMode": paths.is_managed_mode(),
                "agents": agents,
            });
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("state dir:    {}", paths.state_dir().display());
                println!("config:       {}", paths.config_path().display());
                println!("credentials:  {}", paths.oauth_dir().display());
                println!("gateway port: {}", paths.gateway_port(config.gateway.port));
                if paths.is_managed_mode() {
                    println!("managed mode: config is managed externally");
                }
                for agent_id in config.agent_ids() {
                    println!(
                        "agent {agent_id}: dir {} workspace {}",
                        config.resolve_agent_dir(&paths, &agent_id).display(),
                        config.resolve_agent_workspace(&paths, &agent_id).display()
                    );
                }
            }
        }
        Command::Auth {
            command: AuthCommand::Sync { agent, json },
        } => {
            let agent_ids = match agent {
                Some(agent) => vec![normalize_agent_id(&agent)],
                None => config.agent_ids(),
            };
            let profiles = AuthProfiles::new(paths.clone());
            let mut output = Vec::new();
            for agent_id in agent_ids {
                let agent_dir = config.resolve_agent_dir(&paths, &agent_id);
                let store = profiles
                    .ensure_auth_profile_store(&agent_dir)
                    .with_context(|| format!("failed to sync credentials for agent {agent_id}"))?;
                // Secrets are never printed.
                let summary: Vec<_> = store
                    .profiles
                    .iter()
                    .map(|(id, profile)| {
                        serde_json::json!({
                            "id": id,
                            "type": profile.kind(),
                            "provider": profile.provider(),
                            "expires": profile.expires(),
                        })
                    })
                    .collect();
                if !json {
                    println!("agent {agent_id} ({})", agent_dir.display());
                    for (id, profile) in &store.profiles {
                        let expires = profile
                            .expires()
                            .and_then(chrono::DateTime::from_timestamp_millis)
                            .map(|at| format!(" expires {}", at.to_rfc3339()))
                            .unwrap_or_default();
                        println!("  {id} [{}]{expires}", profile.kind());
                    }
                }
                output.push(serde_json::json!({ "agentId": agent_id, "profiles": summary }));
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }
        Command::Workspace {
            command: WorkspaceCommand::Init { agent },
        } => {
            let agent_id = agent
                .map(|agent| normalize_agent_id(&agent))
                .unwrap_or_else(|| config.default_agent_id());
            let dir = config.resolve_agent_workspace(&paths, &agent_id);
            let layout = WorkspaceManager::new()
                .ensure_agent_workspace(EnsureWorkspaceOptions {
                    dir: &dir,
                    ensure_bootstrap_files: true,
                })
                .await
                .with_context(|| format!("failed to initialize workspace {}", dir.display()))?;
            println!("workspace for agent {agent_id}: {}", layout.dir.display());
            if layout.created_files.is_empty() {
                println!("  nothing to create");
            }
            for name in &layout.created_files {
                println!("  created {name}");
            }
        }
    }

    Ok(())
}

fn print_fix_result(result: &SecurityFixResult) {
    println!("security fixes ({})", if result.ok { "ok" } else { "with errors" });
    for change in &result.changes {
        println!("  config: {change}");
    }
    if result.config_written {
        println!("  wrote {}", result.config_path.display());
    }
    for action in &result.actions {
        match &action.outcome {
            PermissionOutcome::Applied { previous } => {
                println!("  chmod {} -> {} {}", previous, action.mode, action.path.display());
            }
            PermissionOutcome::Skipped { reason }
                if !matches!(reason, SkipReason::Already | SkipReason::Missing) =>
            {
                println!("  skipped ({}) {}", reason.as_str(), action.path.display());
            }
            _ => {}
        }
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}

fn print_audit_report(report: &SecurityAuditReport) {
    println!(
        "security audit: {} critical, {} warn, {} info",
        report.summary.critical, report.summary.warn, report.summary.info
    );
    for finding in &report.findings {
        println!("  [{}] {}: {}", finding.severity.as_str(), finding.title, finding.detail);
        if let Some(remediation) = &finding.remediation {
            println!("      fix: {remediation}");
        }
    }
}
