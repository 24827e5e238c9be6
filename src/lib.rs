//! Epiloop: identity and session orchestration for a multi-channel chat gateway.
//!
//! For every inbound event this crate decides which agent and session handle
//! it, whether the group is admitted, whether the session runs sandboxed,
//! what workspace context it gets and which provider credentials are valid.

pub mod auth_profiles;
pub mod config;
pub mod error;
pub mod fs_util;
pub mod groups;
pub mod logging;
pub mod pairing;
pub mod paths;
pub mod routing;
pub mod sandbox;
pub mod security;
pub mod session_key;
pub mod workspace;

pub use auth_profiles::{AuthProfile, AuthProfileStore, AuthProfiles};
pub use config::{Config, ConfigIssue, ConfigSnapshot};
pub use error::{Error, Result};
pub use paths::Paths;
pub use sandbox::{SandboxContext, resolve_sandbox_context};
pub use security::{SecurityFixResult, audit_security, fix_security_footguns};
pub use session_key::{SessionKey, SessionKeyResolver};
pub use workspace::WorkspaceManager;
