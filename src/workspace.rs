//! Agent workspace bootstrapping: AGENTS.md, SOUL.md, TOOLS.md, IDENTITY.md,
//! USER.md, HEARTBEAT.md and the one-time BOOTSTRAP.md onboarding note.

use crate::error::{Result, WorkspaceError};
use crate::session_key::SessionKeyResolver;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;

use std::path::{Path, PathBuf};

pub const AGENTS_FILENAME: &str = "AGENTS.md";
pub const SOUL_FILENAME: &str = "SOUL.md";
pub const TOOLS_FILENAME: &str = "TOOLS.md";
pub const IDENTITY_FILENAME: &str = "IDENTITY.md";
pub const USER_FILENAME: &str = "USER.md";
pub const HEARTBEAT_FILENAME: &str = "HEARTBEAT.md";
pub const BOOTSTRAP_FILENAME: &str = "BOOTSTRAP.md";

const STATE_DIRNAME: &str = ".epiloop";
const STATE_FILENAME: &str = "workspace-state.json";
const STATE_VERSION: u32 = 1;

/// Files kept present in every workspace, in injection order.
const SEEDED_FILES: [(&str, &str); 6] = [
    (AGENTS_FILENAME, include_str!("../templates/AGENTS.md")),
    (SOUL_FILENAME, include_str!("../templates/SOUL.md")),
    (TOOLS_FILENAME, include_str!("../templates/TOOLS.md")),
    (IDENTITY_FILENAME, include_str!("../templates/IDENTITY.md")),
    (USER_FILENAME, include_str!("../templates/USER.md")),
    (HEARTBEAT_FILENAME, include_str!("../templates/HEARTBEAT.md")),
];

const BOOTSTRAP_TEMPLATE: &str = include_str!("../templates/BOOTSTRAP.md");

/// Files injected into delegated sessions.
const SUBAGENT_BOOTSTRAP_FILES: [&str; 2] = [AGENTS_FILENAME, TOOLS_FILENAME];

/// One bootstrap file as loaded from a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceBootstrapFile {
    pub name: String,
    pub path: PathBuf,
    pub content: Option<String>,
    pub missing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceState {
    version: u32,
    bootstrap_seeded_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Initializes version control in a fresh workspace.
pub trait VersionControl: Send + Sync {
    fn init_repository(
        &self,
        dir: &Path,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Runs `git init` through the system git binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

impl VersionControl for GitCli {
    async fn init_repository(&self, dir: &Path) -> anyhow::Result<()> {
        if tokio::fs::try_exists(dir.join(".git")).await.unwrap_or(false) {
            return Ok(());
        }
        let status = tokio::process::Command::new("git")
            .arg("init")
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("failed to run git")?;
        if !status.success() {
            anyhow::bail!("git init exited with {status}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnsureWorkspaceOptions<'a> {
    pub dir: &'a Path,
    pub ensure_bootstrap_files: bool,
}

/// What [`WorkspaceManager::ensure_agent_workspace`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLayout {
    pub dir: PathBuf,
    /// True when no bootstrap file existed and the workspace was never seeded.
    pub brand_new: bool,
    pub created_files: Vec<String>,
}

/// Creates and seeds agent workspaces.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceManager<V = GitCli> {
    vcs: V,
}

impl WorkspaceManager<GitCli> {
    pub fn new() -> Self {
        Self { vcs: GitCli }
    }
}

impl<V: VersionControl> WorkspaceManager<V> {
    pub fn with_version_control(vcs: V) -> Self {
        Self { vcs }
    }

    /// Make sure `dir` exists and, when asked, holds the bootstrap files.
    ///
    /// Existing files are never overwritten. BOOTSTRAP.md is written only for
    /// a brand-new workspace and is not recreated after it was seeded once.
    /// A failing `git init` is logged and otherwise ignored.
    pub async fn ensure_agent_workspace(
        &self,
        options: EnsureWorkspaceOptions<'_>,
    ) -> Result<WorkspaceLayout> {
        let dir = options.dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;

        let mut layout = WorkspaceLayout {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        if !options.ensure_bootstrap_files {
            return Ok(layout);
        }

        let mut state = read_state(dir).await;
        let mut any_existing = false;
        for name in SEEDED_FILES
            .iter()
            .map(|(name, _)| *name)
            .chain([BOOTSTRAP_FILENAME])
        {
            if tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false) {
                any_existing = true;
                break;
            }
        }
        layout.brand_new = !any_existing && state.bootstrap_seeded_at.is_none();

        for (name, template) in SEEDED_FILES {
            if write_if_missing(&dir.join(name), template).await? {
                layout.created_files.push(name.to_string());
            }
        }

        if layout.brand_new {
            if write_if_missing(&dir.join(BOOTSTRAP_FILENAME), BOOTSTRAP_TEMPLATE).await? {
                layout.created_files.push(BOOTSTRAP_FILENAME.to_string());
            }
            state.version = STATE_VERSION;
            state.bootstrap_seeded_at = Some(chrono::Utc::now());
            if let Err(error) = write_state(dir, &state).await {
                tracing::warn!(%error, dir = %dir.display(), "failed to record workspace state");
            }

            if let Err(error) = self.vcs.init_repository(dir).await {
                tracing::warn!(%error, dir = %dir.display(), "git init failed for new workspace");
            }
        }

        if !layout.created_files.is_empty() {
            tracing::info!(
                dir = %dir.display(),
                created = ?layout.created_files,
                "seeded workspace bootstrap files"
            );
        }

        Ok(layout)
    }
}

/// Create `path` with `content` unless it already exists. Returns whether the
/// file was written. Safe to race: `create_new` fails if another writer won.
async fn write_if_missing(path: &Path, content: &str) -> Result<bool> {
    let opened = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(source) => {
            return Err(WorkspaceError::WriteFile {
                path: path.to_path_buf(),
                source,
            }
            .into());
        }
    };
    file.write_all(content.as_bytes())
        .await
        .map_err(|source| WorkspaceError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(true)
}

async fn read_state(dir: &Path) -> WorkspaceState {
    let path = dir.join(STATE_DIRNAME).join(STATE_FILENAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|error| {
            tracing::warn!(%error, path = %path.display(), "ignoring corrupt workspace state");
            WorkspaceState::default()
        }),
        Err(_) => WorkspaceState::default(),
    }
}

async fn write_state(dir: &Path, state: &WorkspaceState) -> anyhow::Result<()> {
    let path = dir.join(STATE_DIRNAME).join(STATE_FILENAME);
    let data = serde_json::to_vec_pretty(state).context("failed to serialize workspace state")?;
    tokio::task::spawn_blocking(move || {
        crate::fs_util::write_atomic(&path, &data, crate::fs_util::FileMode::Default)
            .with_context(|| format!("failed to write {}", path.display()))
    })
    .await
    .context("workspace state writer panicked")?
}

/// Load every bootstrap file in injection order, flagging missing ones.
pub async fn load_workspace_bootstrap_files(dir: &Path) -> Vec<WorkspaceBootstrapFile> {
    let names = SEEDED_FILES
        .iter()
        .map(|(name, _)| *name)
        .chain([BOOTSTRAP_FILENAME]);

    let mut files = Vec::new();
    for name in names {
        let path = dir.join(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "failed to read bootstrap file");
                None
            }
        };
        files.push(WorkspaceBootstrapFile {
            name: name.to_string(),
            missing: content.is_none(),
            path,
            content,
        });
    }
    files
}

/// Subagent sessions only get AGENTS.md and TOOLS.md; persona, identity and
/// heartbeat context stays with the sessions that talk to people.
pub fn filter_bootstrap_files_for_session(
    files: Vec<WorkspaceBootstrapFile>,
    session_key: &str,
) -> Vec<WorkspaceBootstrapFile> {
    if !SessionKeyResolver::default().is_subagent(session_key) {
        return files;
    }
    SUBAGENT_BOOTSTRAP_FILES
        .iter()
        .filter_map(|wanted| files.iter().find(|file| file.name == *wanted).cloned())
        .collect()
}

/// Seed `target` with the agent's bootstrap files (or templates when the
/// agent has none). Never overwrites, never touches version control.
pub async fn seed_bootstrap_files_from(source: &Path, target: &Path) -> Result<Vec<String>> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|source| WorkspaceError::CreateDir {
            path: target.to_path_buf(),
            source,
        })?;

    let mut created = Vec::new();
    for (name, template) in SEEDED_FILES {
        let content = tokio::fs::read_to_string(source.join(name))
            .await
            .unwrap_or_else(|_| template.to_string());
        if write_if_missing(&target.join(name), &content).await? {
            created.push(name.to_string());
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct RecordingVcs {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl VersionControl for RecordingVcs {
        async fn init_repository(&self, _dir: &Path) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("git missing");
            }
            Ok(())
        }
    }

    fn options(dir: &Path) -> EnsureWorkspaceOptions<'_> {
        EnsureWorkspaceOptions {
            dir,
            ensure_bootstrap_files: true,
        }
    }

    #[tokio::test]
    async fn brand_new_workspace_gets_all_seven_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("ws");
        let vcs = RecordingVcs::default();
        let manager = WorkspaceManager::with_version_control(vcs.clone());

        let layout = manager
            .ensure_agent_workspace(options(&dir))
            .await
            .expect("workspace should be created");

        assert!(layout.brand_new);
        assert_eq!(layout.created_files.len(), 7);
        for file in load_workspace_bootstrap_files(&dir).await {
            assert!(!file.missing, "{} should exist", file.name);
        }
        assert_eq!(vcs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_files_are_never_overwritten() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("ws");
        let manager = WorkspaceManager::with_version_control(RecordingVcs::default());
        manager.ensure_agent_workspace(options(&dir)).await.expect("first");

        tokio::fs::write(dir.join(SOUL_FILENAME), "hand edited")
            .await
            .expect("edit soul");
        let layout = manager.ensure_agent_workspace(options(&dir)).await.expect("second");

        assert!(!layout.brand_new);
        assert!(layout.created_files.is_empty());
        let soul = tokio::fs::read_to_string(dir.join(SOUL_FILENAME))
            .await
            .expect("read soul");
        assert_eq!(soul, "hand edited");
    }

    #[tokio::test]
    async fn onboarding_note_is_single_use() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("ws");
        let vcs = RecordingVcs::default();
        let manager = WorkspaceManager::with_version_control(vcs.clone());
        manager.ensure_agent_workspace(options(&dir)).await.expect("first");

        tokio::fs::remove_file(dir.join(BOOTSTRAP_FILENAME))
            .await
            .expect("delete onboarding note");
        tokio::fs::remove_file(dir.join(USER_FILENAME))
            .await
            .expect("delete user file");

        let layout = manager.ensure_agent_workspace(options(&dir)).await.expect("second");
        assert_eq!(layout.created_files, vec![USER_FILENAME.to_string()]);
        assert!(!dir.join(BOOTSTRAP_FILENAME).exists());
        assert_eq!(vcs.calls.load(Ordering::SeqCst), 1, "git init only on first creation");
    }

    #[tokio::test]
    async fn onboarding_note_survives_wiping_every_bootstrap_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("ws");
        let manager = WorkspaceManager::with_version_control(RecordingVcs::default());
        manager.ensure_agent_workspace(options(&dir)).await.expect("first");

        for file in load_workspace_bootstrap_files(&dir).await {
            tokio::fs::remove_file(&file.path).await.expect("delete");
        }
        let layout = manager.ensure_agent_workspace(options(&dir)).await.expect("second");
        assert!(!layout.brand_new);
        assert!(!dir.join(BOOTSTRAP_FILENAME).exists());
    }

    #[tokio::test]
    async fn git_failure_is_not_fatal() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("ws");
        let vcs = RecordingVcs {
            fail: true,
            ..Default::default()
        };
        let manager = WorkspaceManager::with_version_control(vcs.clone());

        let layout = manager
            .ensure_agent_workspace(options(&dir))
            .await
            .expect("git failure must be swallowed");
        assert!(layout.brand_new);
        assert_eq!(vcs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn without_bootstrap_only_the_directory_is_created() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("a").join("b");
        let vcs = RecordingVcs::default();
        let manager = WorkspaceManager::with_version_control(vcs.clone());
        manager
            .ensure_agent_workspace(EnsureWorkspaceOptions {
                dir: &dir,
                ensure_bootstrap_files: false,
            })
            .await
            .expect("dir");
        assert!(dir.is_dir());
        assert!(load_workspace_bootstrap_files(&dir).await.iter().all(|f| f.missing));
        assert_eq!(vcs.calls.load(Ordering::SeqCst), 0);
    }

    fn sample_files() -> Vec<WorkspaceBootstrapFile> {
        [
            AGENTS_FILENAME,
            SOUL_FILENAME,
            TOOLS_FILENAME,
            IDENTITY_FILENAME,
            USER_FILENAME,
            HEARTBEAT_FILENAME,
            BOOTSTRAP_FILENAME,
        ]
        .iter()
        .map(|name| WorkspaceBootstrapFile {
            name: name.to_string(),
            path: PathBuf::from(name),
            content: Some(format!("# {name}")),
            missing: false,
        })
        .collect()
    }

    #[test]
    fn subagent_sessions_get_reduced_set_in_order() {
        let mut files = sample_files();
        files.reverse();
        let filtered = filter_bootstrap_files_for_session(files, "agent:main:subagent:abc");
        let names: Vec<_> = filtered.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![AGENTS_FILENAME, TOOLS_FILENAME]);
    }

    #[test]
    fn other_sessions_get_full_set_unchanged() {
        for key in ["agent:main:main", "main", "agent:ops:group:slack:default:c1"] {
            let filtered = filter_bootstrap_files_for_session(sample_files(), key);
            assert_eq!(filtered, sample_files(), "key {key}");
        }
    }

    #[tokio::test]
    async fn seeding_copies_agent_files_without_overwrite() {
        let root = tempfile::tempdir().expect("tempdir");
        let source = root.path().join("agent");
        let target = root.path().join("sandbox");
        tokio::fs::create_dir_all(&source).await.expect("mkdir");
        tokio::fs::write(source.join(SOUL_FILENAME), "agent soul").await.expect("soul");
        tokio::fs::create_dir_all(&target).await.expect("mkdir");
        tokio::fs::write(target.join(TOOLS_FILENAME), "sandbox tools").await.expect("tools");

        let created = seed_bootstrap_files_from(&source, &target).await.expect("seed");
        assert!(!created.contains(&TOOLS_FILENAME.to_string()));
        assert_eq!(
            tokio::fs::read_to_string(target.join(SOUL_FILENAME)).await.expect("read"),
            "agent soul"
        );
        assert_eq!(
            tokio::fs::read_to_string(target.join(TOOLS_FILENAME)).await.expect("read"),
            "sandbox tools"
        );
        assert!(!target.join(BOOTSTRAP_FILENAME).exists());
    }
}
