//! Configuration loading and root folder resolution
//!
//! Bootstrap settings come from a TOML file. Every section is optional and a
//! missing file is not an error: compiled defaults apply.

use crate::levels::SteppedLevelCurve;
use crate::tier::Tier;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "LUMEN_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "lumen.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Data folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database path; defaults to `<root_folder>/lumen.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// HTTP server port for the progress tracker
    #[serde(default)]
    pub port: Option<u16>,

    /// TOML course catalog; the built-in catalog is used when absent
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub points: PointsPolicy,

    #[serde(default)]
    pub levels: LevelsConfig,

    #[serde(default)]
    pub tiers: TierConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Points awarded for learning activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsPolicy {
    /// Awarded when a video module is completed
    #[serde(default = "default_video_points")]
    pub video_completion: i64,

    /// Awarded when a course (project/certification) reaches 100 %
    #[serde(default = "default_course_points")]
    pub course_completion: i64,
}

impl Default for PointsPolicy {
    fn default() -> Self {
        Self {
            video_completion: default_video_points(),
            course_completion: default_course_points(),
        }
    }
}

fn default_video_points() -> i64 {
    5
}

fn default_course_points() -> i64 {
    20
}

/// Level curve parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LevelsConfig {
    #[serde(default = "default_base_points")]
    pub base_points: i64,
    #[serde(default = "default_step_increase")]
    pub step_increase: i64,
    #[serde(default = "default_max_level")]
    pub max_level: i64,
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            base_points: default_base_points(),
            step_increase: default_step_increase(),
            max_level: default_max_level(),
        }
    }
}

fn default_base_points() -> i64 {
    SteppedLevelCurve::DEFAULT_BASE_POINTS
}

fn default_step_increase() -> i64 {
    SteppedLevelCurve::DEFAULT_STEP_INCREASE
}

fn default_max_level() -> i64 {
    SteppedLevelCurve::DEFAULT_MAX_LEVEL
}

impl LevelsConfig {
    pub fn curve(&self) -> Result<SteppedLevelCurve> {
        SteppedLevelCurve::new(self.base_points, self.step_increase, self.max_level)
    }
}

/// What "mark complete" does when a completion row already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the existing row and skip the insert
    #[default]
    SkipExisting,
    /// Insert another row regardless (completion as event log)
    InsertAlways,
}

/// Tier selection settings
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TierConfig {
    /// Tier used when a request names none or an unknown one
    #[serde(default = "default_tier")]
    pub default: Tier,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

fn default_tier() -> Tier {
    Tier::DEFAULT
}

impl TomlConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load an explicit config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `explicit` if given, else the first platform config file found
    ///
    /// Missing or unreadable files fall back to defaults with a warning.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => locate_config_file(),
        };

        match path {
            Some(p) => Self::load(&p).unwrap_or_else(|e| {
                warn!("Could not load config {}: {}; using defaults", p.display(), e);
                Self::default()
            }),
            None => {
                info!("No config file found, using compiled defaults");
                Self::default()
            }
        }
    }

    /// Database location given the resolved root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| root_folder.join(DATABASE_FILE_NAME))
    }
}

/// Root folder resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// First existing config file: `~/.config/lumen/config.toml`, then `/etc/lumen/config.toml`
fn locate_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("lumen").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/lumen/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("lumen"))
        .unwrap_or_else(|| PathBuf::from("./lumen_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = TomlConfig::from_toml_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.points.video_completion, 5);
        assert_eq!(config.points.course_completion, 20);
        assert_eq!(config.levels, LevelsConfig::default());
        assert_eq!(config.tiers.default, Tier::Moderate);
        assert_eq!(config.tiers.duplicate_policy, DuplicatePolicy::SkipExisting);
    }

    #[test]
    fn test_full_toml() {
        let config = TomlConfig::from_toml_str(
            r#"
            root_folder = "/srv/lumen"
            port = 6000
            catalog_path = "/srv/lumen/catalog.toml"

            [logging]
            level = "debug"

            [points]
            video_completion = 7

            [levels]
            base_points = 40
            max_level = 10

            [tiers]
            default = "intensive"
            duplicate_policy = "insert_always"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/lumen")));
        assert_eq!(config.port, Some(6000));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.points.video_completion, 7);
        assert_eq!(config.points.course_completion, 20);
        assert_eq!(config.levels.base_points, 40);
        assert_eq!(config.levels.step_increase, 50);
        assert_eq!(config.tiers.default, Tier::Intensive);
        assert_eq!(config.tiers.duplicate_policy, DuplicatePolicy::InsertAlways);
    }

    #[test]
    fn test_invalid_tier_in_toml_is_config_error() {
        let result = TomlConfig::from_toml_str("[tiers]\ndefault = \"ultra\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_database_path_defaults_under_root() {
        let config = TomlConfig::default();
        let root = PathBuf::from("/data/lumen");
        assert_eq!(config.database_path(&root), root.join("lumen.db"));

        let config = TomlConfig {
            database_path: Some(PathBuf::from("/tmp/other.db")),
            ..Default::default()
        };
        assert_eq!(config.database_path(&root), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_levels_config_builds_curve() {
        use crate::levels::LevelCurve;
        let curve = LevelsConfig::default().curve().unwrap();
        assert_eq!(curve.progress(10).points_to_next_level, 90);

        let bad = LevelsConfig {
            base_points: 0,
            ..Default::default()
        };
        assert!(bad.curve().is_err());
    }
}
