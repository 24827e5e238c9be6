//! Approved-sender lists maintained by channel pairing flows.

use crate::paths::Paths;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use std::path::PathBuf;

/// Channels whose adapters run a pairing flow and keep an allow list.
pub const PAIRING_CHANNELS: [&str; 6] = ["telegram", "whatsapp", "signal", "imessage", "discord", "slack"];

pub fn supports_pairing(channel: &str) -> bool {
    let channel = channel.trim().to_lowercase();
    PAIRING_CHANNELS.contains(&channel.as_str())
}

/// Read access to previously approved senders.
pub trait PairingStore: Send + Sync {
    fn read_allow_from(&self, channel: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllowFromFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    allow_from: Vec<serde_json::Value>,
}

/// Reads `<oauth_dir>/<channel>-allowFrom.json`.
#[derive(Debug, Clone)]
pub struct FilePairingStore {
    dir: PathBuf,
}

impl FilePairingStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.oauth_dir().to_path_buf(),
        }
    }

    pub fn path_for(&self, channel: &str) -> PathBuf {
        self.dir
            .join(format!("{}-allowFrom.json", channel.trim().to_lowercase()))
    }
}

impl PairingStore for FilePairingStore {
    fn read_allow_from(&self, channel: &str) -> anyhow::Result<Vec<String>> {
        let path = self.path_for(channel);
        let Some(bytes) = crate::fs_util::read_optional(&path)
            .with_context(|| format!("failed to read {}", path.display()))?
        else {
            return Ok(Vec::new());
        };
        let file: AllowFromFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let mut senders: Vec<String> = Vec::new();
        for value in file.allow_from {
            let sender = match value {
                serde_json::Value::String(text) => text.trim().to_string(),
                serde_json::Value::Number(number) => number.to_string(),
                _ => continue,
            };
            if !sender.is_empty() && !senders.contains(&sender) {
                senders.push(sender);
            }
        }
        Ok(senders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &std::path::Path) -> FilePairingStore {
        let oauth = root.join("creds");
        let paths = Paths::resolve(root.to_path_buf(), root.to_path_buf(), move |name| {
            (name == crate::paths::OAUTH_DIR_ENV).then(|| oauth.to_string_lossy().to_string())
        });
        FilePairingStore::new(&paths)
    }

    #[test]
    fn missing_file_means_no_senders() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(store(dir.path()).read_allow_from("telegram").expect("read").is_empty());
    }

    #[test]
    fn reads_strings_and_numbers_deduplicated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        std::fs::create_dir_all(dir.path().join("creds")).expect("mkdir");
        std::fs::write(
            store.path_for("Telegram"),
            r#"{ "version": 1, "allowFrom": ["123", 123, " 456 ", "", null] }"#,
        )
        .expect("write");

        assert_eq!(
            store.read_allow_from("telegram").expect("read"),
            vec!["123".to_string(), "456".to_string()]
        );
    }

    #[test]
    fn pairing_channel_set() {
        assert!(supports_pairing("WhatsApp"));
        assert!(!supports_pairing("matrix"));
    }
}
