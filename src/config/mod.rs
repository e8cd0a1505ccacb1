use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::merger::{DEFAULT_PINNED_PATHS, PriorityPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub priority: PriorityConfig,
    pub fuse: FuseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub work_dir: PathBuf,
    /// How long a filesystem reader waits for an entry that has not been
    /// extracted yet. Zero waits forever.
    pub readiness_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub pinned_paths: Vec<String>,
    pub strict_hash_check: bool,
    /// Number of access ranks that share one tier.
    pub rank_tier_width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub allow_other: bool,
    pub allow_root: bool,
    pub auto_unmount: bool,
    pub fsname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
    pub json: bool,
}

impl Config {
    /// Load `deltabox.*` from the working directory (or `path` when given),
    /// then apply `DELTABOX_*` environment overrides such as
    /// `DELTABOX_STORE__WORK_DIR`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("deltabox").required(false),
        };
        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("DELTABOX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("priority.pinned_paths"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

impl StoreConfig {
    pub fn readiness_timeout(&self) -> Option<Duration> {
        match self.readiness_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl PriorityConfig {
    pub fn policy(&self) -> PriorityPolicy {
        PriorityPolicy::new(self.pinned_paths.iter().cloned())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { work_dir: PathBuf::from("/var/lib/deltabox"), readiness_timeout_secs: 0 }
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            pinned_paths: DEFAULT_PINNED_PATHS.iter().map(|p| p.to_string()).collect(),
            strict_hash_check: false,
            rank_tier_width: 100,
        }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self { allow_other: false, allow_root: false, auto_unmount: true, fsname: "deltabox".to_string() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "deltabox=debug,info".to_string(), json: false }
    }
}
