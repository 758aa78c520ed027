//! Dispatch configuration: where precompiled modules live and which device to use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

pub const DEFAULT_VERSION: &str = "0.5.0";
pub const DEFAULT_ARCH_CLASS: &str = "80_89_90a";
pub const DEFAULT_EXTENSION: &str = "so";

/// Root of the module cache when neither `XDG_CACHE_HOME` nor `HOME` is set.
const FALLBACK_BASE_DIR: &str = "/root/.cache/flashinfer";

pub const ENV_CACHE_DIR: &str = "GLLM_DISPATCH_CACHE_DIR";
pub const ENV_VERSION: &str = "GLLM_DISPATCH_VERSION";
pub const ENV_ARCH: &str = "GLLM_DISPATCH_ARCH";
pub const ENV_DEVICE: &str = "GLLM_DEVICE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Cache root; modules live under `<base_dir>/<version>/<arch_class>/cached_ops`.
    pub base_dir: PathBuf,
    pub version: String,
    pub arch_class: String,
    /// CUDA ordinal used for capability probing and allocations.
    pub device_index: usize,
    /// Shared-object extension, without the dot.
    pub extension: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let base_dir = default_base_dir(&|key: &str| std::env::var(key).ok())
            .unwrap_or_else(|| PathBuf::from(FALLBACK_BASE_DIR));
        Self::with_base_dir(base_dir)
    }
}

impl DispatchConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            version: DEFAULT_VERSION.to_string(),
            arch_class: DEFAULT_ARCH_CLASS.to_string(),
            device_index: 0,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Build from the process environment.
    pub fn from_env() -> DispatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> DispatchResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_dir = lookup(ENV_CACHE_DIR)
            .map(PathBuf::from)
            .or_else(|| default_base_dir(&lookup))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_BASE_DIR));
        let mut config = Self::with_base_dir(base_dir);
        if let Some(version) = lookup(ENV_VERSION) {
            config.version = version;
        }
        if let Some(arch) = lookup(ENV_ARCH) {
            config.arch_class = arch;
        }
        if let Some(device) = lookup(ENV_DEVICE) {
            config.device_index = parse_device(&device)?;
        }
        Ok(config)
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        log::debug!("Loaded dispatch config from {:?}", path);
        Ok(config)
    }

    /// Directory holding one sub-directory per module token.
    pub fn module_root(&self) -> PathBuf {
        self.base_dir
            .join(&self.version)
            .join(&self.arch_class)
            .join("cached_ops")
    }
}

fn default_base_dir<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(xdg) = lookup("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg).join("flashinfer"));
    }
    lookup("HOME").map(|home| PathBuf::from(home).join(".cache").join("flashinfer"))
}

/// Parse `cuda` or `cuda:N`.
fn parse_device(value: &str) -> DispatchResult<usize> {
    let value = value.trim();
    let invalid = || {
        DispatchError::Config(format!(
            "{ENV_DEVICE} must be `cuda` or `cuda:N`, got `{value}`"
        ))
    };
    match value.strip_prefix("cuda").ok_or_else(invalid)? {
        "" => Ok(0),
        rest => {
            let idx = rest.strip_prefix(':').ok_or_else(invalid)?;
            idx.parse::<usize>().map_err(|_| {
                DispatchError::Config(format!("invalid device ordinal in `{value}`"))
            })
        }
    }
}
