//! Node configuration.
//!
//! Node settings live in `~/.config/freight/config.json` and the per-operation
//! defaults in `~/.config/freight/context.json`. Both are optional. Set
//! `FREIGHT_CONFIG_DIR` to read them from another directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use freight_protocol::NodeIdentity;
use freight_requests::ContextConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NodeFile {
    name: String,
    download_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

impl Default for NodeFile {
    fn default() -> Self {
        Self {
            name: default_name(),
            download_dir: None,
            state_dir: None,
        }
    }
}

/// Everything the node reads at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name; also seeds the node identity.
    pub name: String,
    /// Where received files are placed.
    pub download_dir: PathBuf,
    /// Where persistent request records are stored.
    pub state_dir: PathBuf,
    pub context: ContextConfig,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "freight-node".into())
}

impl NodeConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_dir())
    }

    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let node_path = dir.join("config.json");
        let mut file = NodeFile::default();
        if node_path.exists() {
            let content = std::fs::read_to_string(&node_path)
                .with_context(|| format!("reading {}", node_path.display()))?;
            match serde_json::from_str::<NodeFile>(&content) {
                Ok(parsed) => file = parsed,
                Err(e) => tracing::warn!(
                    path = %node_path.display(),
                    error = %e,
                    "failed to parse node config, using defaults"
                ),
            }
        }
        if file.name.trim().is_empty() {
            file.name = default_name();
        }

        let context = ContextConfig::load(&dir.join("context.json"))
            .with_context(|| format!("loading {}", dir.join("context.json").display()))?;

        Ok(Self {
            name: file.name,
            download_dir: file.download_dir.unwrap_or_else(|| dir.join("downloads")),
            state_dir: file.state_dir.unwrap_or_else(|| dir.join("requests")),
            context,
        })
    }

    /// Stable identity derived from the node name and platform.
    pub fn identity(&self) -> NodeIdentity {
        let data = format!("{}-{}-freight", self.name, std::env::consts::OS);
        let digest = <sha2::Sha256 as sha2::Digest>::digest(data.as_bytes());
        NodeIdentity::new(&digest[..8])
    }
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FREIGHT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    config_base_dir().join("freight")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
