//! Process-wide configuration.
//!
//! Every memoized wrapper resolves its effective parameters against a global
//! registry of defaults. Two classes of parameters exist:
//!
//! - *Build-time* parameters (backend, storage location, layout, watch flag,
//!   key maker, store connector) are captured when a wrapper is built;
//!   changing them affects wrappers built afterwards.
//! - *Live* parameters (caching enabled, staleness policy, wait timeout,
//!   null caching, size limit, cleanup policy) are re-read on every call and
//!   take effect immediately for all wrappers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{de, Deserialize, Deserializer};

use crate::backend::shared::ConnectorFactory;
use crate::key::KeyMaker;
use crate::utils::parse_bytes;

/// Selects the storage backend of a wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendSelector {
    /// Per-function directories on the local filesystem.
    File,
    /// A process-local map; no persistence.
    InMemory,
    /// An external document/key-value store reached through a connector.
    SharedDoc,
    /// A relational store; bound to the same connector contract as
    /// [`SharedDoc`](Self::SharedDoc).
    Relational,
}

impl FromStr for BackendSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(BackendSelector::File),
            "memory" | "in-memory" => Ok(BackendSelector::InMemory),
            "shared-doc" => Ok(BackendSelector::SharedDoc),
            "relational" => Ok(BackendSelector::Relational),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendSelector::File => "file",
            BackendSelector::InMemory => "in-memory",
            BackendSelector::SharedDoc => "shared-doc",
            BackendSelector::Relational => "relational",
        };
        f.write_str(name)
    }
}

/// The process-wide default parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// When false, every wrapper short-circuits to direct invocation.
    pub caching_enabled: bool,

    /// Default backend for wrappers that do not choose one.
    pub backend: BackendSelector,

    /// Root directory for the file backend. Each function gets a
    /// subdirectory beneath it.
    pub cache_dir: PathBuf,

    /// File backend layout: one file per entry instead of one file per
    /// function.
    pub separate_files: bool,

    /// Watch function directories for external modification. Disabling this
    /// trades cross-process freshness for fewer filesystem resources.
    pub watch: bool,

    /// Age beyond which a cached value counts as stale.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// On a stale hit, return the old value and recompute in the background
    /// instead of recomputing synchronously.
    pub serve_stale: bool,

    /// How long to wait on another producer's in-flight computation. Zero
    /// means the backend's own default: a bounded poll for the file backend,
    /// an unbounded wait for the shared backend. Non-zero also sets the
    /// shared backend's in-flight lease.
    #[serde(with = "humantime_serde")]
    pub wait_for_calc_timeout: Duration,

    /// Store null results. When false a null return is recomputed on every
    /// call.
    pub allow_none: bool,

    /// Largest serialized value the cache will store. Accepts plain byte
    /// counts or strings like `"10MB"`.
    #[serde(deserialize_with = "deserialize_size_limit")]
    pub entry_size_limit: Option<u64>,

    /// Periodically delete entries older than the staleness window.
    pub cleanup_stale: bool,

    /// Minimum time between stale-entry cleanup runs.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            caching_enabled: true,
            backend: BackendSelector::File,
            cache_dir: default_cache_root(),
            separate_files: false,
            watch: true,
            stale_after: Duration::MAX,
            serve_stale: false,
            wait_for_calc_timeout: Duration::ZERO,
            allow_none: false,
            entry_size_limit: None,
            cleanup_stale: false,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl GlobalConfig {
    /// Reads a config from a YAML file.
    pub fn from_path(path: &Path) -> anyhow::Result<GlobalConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open config file at {}", path.display()))?;
        Self::from_reader(contents.as_bytes())
    }

    fn from_reader(mut reader: impl std::io::Read) -> anyhow::Result<GlobalConfig> {
        let mut contents = String::new();
        reader
            .read_to_string(&mut contents)
            .context("failed to read config")?;
        serde_yaml::from_str(&contents).context("failed to parse config YAML")
    }
}

fn deserialize_size_limit<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        None,
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::None => Ok(None),
        Raw::Number(n) => Ok(Some(n)),
        Raw::Text(s) => parse_bytes(&s).map(Some).map_err(de::Error::custom),
    }
}

/// The default file-backend root: `$XDG_CACHE_HOME/permacache`, falling back
/// to `~/.cache/permacache`.
pub fn default_cache_root() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("permacache");
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".cache").join("permacache");
        }
    }
    std::env::temp_dir().join("permacache")
}

/// The registry holds the serde-able config next to the injectable defaults
/// that cannot be expressed in a config file.
#[derive(Default)]
pub(crate) struct Registry {
    pub config: GlobalConfig,
    pub key_maker: Option<Arc<dyn KeyMaker>>,
    pub connector: Option<ConnectorFactory>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(RwLock::default);

/// Mutates the global defaults. Live parameters apply to existing wrappers
/// immediately; build-time parameters apply to wrappers built afterwards.
pub fn configure(f: impl FnOnce(&mut GlobalConfig)) {
    f(&mut REGISTRY.write().config);
}

/// Replaces the global defaults with a config loaded from a YAML file.
pub fn load_from_path(path: &Path) -> anyhow::Result<()> {
    let config = GlobalConfig::from_path(path)?;
    REGISTRY.write().config = config;
    Ok(())
}

/// A snapshot of the current global defaults.
pub fn snapshot() -> GlobalConfig {
    REGISTRY.read().config.clone()
}

/// Sets or clears the process-wide default fingerprinter.
pub fn set_default_key_maker(key_maker: Option<Arc<dyn KeyMaker>>) {
    REGISTRY.write().key_maker = key_maker;
}

/// Sets or clears the process-wide shared-store connector factory. A set
/// factory makes `shared-doc` the effective backend for wrappers built
/// without an explicit choice.
pub fn set_connector_factory(factory: Option<ConnectorFactory>) {
    REGISTRY.write().connector = factory;
}

pub(crate) fn default_key_maker() -> Option<Arc<dyn KeyMaker>> {
    REGISTRY.read().key_maker.clone()
}

pub(crate) fn default_connector_factory() -> Option<ConnectorFactory> {
    REGISTRY.read().connector.clone()
}

/// Re-enables caching globally.
pub fn enable_caching() {
    configure(|config| config.caching_enabled = true);
}

/// Disables caching globally; every wrapper invokes directly until caching
/// is re-enabled.
pub fn disable_caching() {
    configure(|config| config.caching_enabled = false);
}
