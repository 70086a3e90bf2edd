use crate::storage::models::OperationMode;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;

pub const MIN_SCAN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub scan_timeout_secs: Option<u64>,
    #[serde(default)]
    pub checksums_enabled: bool,
    #[serde(default = "default_missing_retention_days")]
    pub missing_retention_days: u64,
    #[serde(default)]
    pub link_rewrites: Vec<LinkRewrite>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

/// Prefix substitution applied to symlink targets written by MOVE_WITH_LINK.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LinkRewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_caution_pct")]
    pub caution_threshold_pct: u8,
    #[serde(default = "default_critical_pct")]
    pub critical_threshold_pct: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    pub path: String,
    #[serde(default)]
    pub mode: OperationMode,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Location names in priority order.
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<CriterionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriterionConfig {
    pub kind: String,
    pub op: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_db_path() -> String {
    "frostline.db".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_missing_retention_days() -> u64 {
    30
}

fn default_caution_pct() -> u8 {
    20
}

fn default_critical_pct() -> u8 {
    10
}

fn default_scan_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            db_path: default_db_path(),
            worker_threads: default_worker_threads(),
            tick_interval_ms: default_tick_interval_ms(),
            scan_timeout_secs: None,
            checksums_enabled: false,
            missing_retention_days: default_missing_retention_days(),
            link_rewrites: Vec::new(),
            locations: Vec::new(),
            roots: Vec::new(),
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(Environment::with_prefix("FROSTLINE").separator("__"))
        .build()?;
    let config = builder.try_deserialize::<AppConfig>()?;
    validate(&config)?;
    Ok(config)
}

/// Structural checks that do not need the database.
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.worker_threads == 0 {
        return Err(ConfigError::Message(
            "worker_threads must be at least 1".to_string(),
        ));
    }

    let root_paths: Vec<String> = config.roots.iter().map(|r| r.path.clone()).collect();
    if let Some((outer, inner)) = nested_directories(&root_paths).into_iter().next() {
        return Err(ConfigError::Message(format!(
            "monitored root '{}' is nested inside '{}'",
            inner, outer
        )));
    }

    for root in &config.roots {
        for name in &root.locations {
            if !config.locations.iter().any(|l| &l.name == name) {
                return Err(ConfigError::Message(format!(
                    "root '{}' references unknown storage location '{}'",
                    root.path, name
                )));
            }
        }
    }

    for location in &config.locations {
        let location_path = Path::new(&location.path);
        if let Some(root) = config.roots.iter().find(|r| {
            let root_path = Path::new(&r.path);
            location_path.starts_with(root_path) || root_path.starts_with(location_path)
        }) {
            return Err(ConfigError::Message(format!(
                "storage location '{}' overlaps monitored root '{}'",
                location.name, root.path
            )));
        }
        if location.critical_threshold_pct > 100 || location.caution_threshold_pct > 100 {
            return Err(ConfigError::Message(format!(
                "thresholds for location '{}' must be percentages",
                location.name
            )));
        }
    }

    Ok(())
}

/// Clamp a configured scan interval to the supported minimum.
pub fn effective_scan_interval(secs: u64) -> u64 {
    secs.max(MIN_SCAN_INTERVAL_SECS)
}

/// Return (outer, inner) pairs where one directory lies inside another.
pub fn nested_directories(dirs: &[String]) -> Vec<(String, String)> {
    let mut nested = Vec::new();

    for (i, dir) in dirs.iter().enumerate() {
        let dir_path = Path::new(dir);
        for other in dirs.iter().skip(i + 1) {
            let other_path = Path::new(other);

            if dir_path.starts_with(other_path) {
                nested.push((other.clone(), dir.clone()));
            } else if other_path.starts_with(dir_path) {
                nested.push((dir.clone(), other.clone()));
            }
        }
    }

    nested
}
