pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "infraflow.yaml";
pub const CONFIG_PATH_ENV: &str = "INFRAFLOW_CONFIG_PATH";
pub const STATE_DIR_ENV: &str = "INFRAFLOW_STATE_DIR";
pub const MAX_CONCURRENCY_ENV: &str = "INFRAFLOW_MAX_CONCURRENCY";

/// Settings shared by every infraflow command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where flow state documents live; defaults to the user data directory
    pub state_dir: Option<PathBuf>,
    pub max_concurrency: usize,
    pub retry: RetrySettings,
    pub step_timeout_secs: u64,
    pub gcp: GcpSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            max_concurrency: 4,
            retry: RetrySettings::default(),
            step_timeout_secs: 300,
            gcp: GcpSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Optional overrides for the Google Cloud endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpSettings {
    pub compute_endpoint: Option<String>,
    pub iam_endpoint: Option<String>,
    pub resource_manager_endpoint: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply `INFRAFLOW_STATE_DIR` and `INFRAFLOW_MAX_CONCURRENCY`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV)
            && !dir.trim().is_empty()
        {
            self.state_dir = Some(PathBuf::from(dir));
        }

        if let Ok(value) = std::env::var(MAX_CONCURRENCY_ENV) {
            let parsed: usize = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv {
                    name: MAX_CONCURRENCY_ENV,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
            if parsed == 0 {
                return Err(ConfigError::InvalidEnv {
                    name: MAX_CONCURRENCY_ENV,
                    value,
                    reason: "must be at least 1".to_string(),
                });
            }
            self.max_concurrency = parsed;
        }
        Ok(())
    }

    /// Resolved flow state directory
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_dir()
                .ok_or(ConfigError::DataDirNotFound)?
                .join("infraflow")
                .join("state")),
        }
    }

    /// Directory holding legacy bookkeeping files
    pub fn legacy_dir(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("legacy"))
    }
}

/// Locate the settings file
///
/// Search order:
/// 1. `INFRAFLOW_CONFIG_PATH`
/// 2. `./infraflow.yaml`
/// 3. `./.infraflow/infraflow.yaml`
/// 4. `~/.config/infraflow/infraflow.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let current_dir = std::env::current_dir()?;
    for path in [
        current_dir.join(CONFIG_FILE_NAME),
        current_dir.join(".infraflow").join(CONFIG_FILE_NAME),
    ] {
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("infraflow").join(CONFIG_FILE_NAME);
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

/// Discovered settings with env overrides applied; defaults when no file exists
pub fn load_settings() -> Result<Settings> {
    let mut settings = match find_config_file()? {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.apply_env_overrides()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_defaults_for_partial_file() {
        let settings = Settings::from_yaml_str(
            r#"
max_concurrency: 8
retry:
  max_attempts: 2
gcp:
  compute_endpoint: http://localhost:8080/compute/v1
"#,
        )
        .unwrap();

        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.initial_delay_ms, 1000);
        assert_eq!(settings.step_timeout_secs, 300);
        assert_eq!(
            settings.gcp.compute_endpoint.as_deref(),
            Some("http://localhost:8080/compute/v1")
        );
        assert!(settings.gcp.iam_endpoint.is_none());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Settings::from_yaml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn test_unparseable_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "max_concurrency: [1, 2]").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_state_dir_layout() {
        let settings = Settings {
            state_dir: Some(PathBuf::from("/var/lib/infraflow")),
            ..Default::default()
        };
        assert_eq!(
            settings.legacy_dir().unwrap(),
            PathBuf::from("/var/lib/infraflow/legacy")
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                (STATE_DIR_ENV, Some("/tmp/infraflow-state")),
                (MAX_CONCURRENCY_ENV, Some("2")),
            ],
            || {
                let mut settings = Settings::default();
                settings.apply_env_overrides().unwrap();
                assert_eq!(settings.state_dir, Some(PathBuf::from("/tmp/infraflow-state")));
                assert_eq!(settings.max_concurrency, 2);
            },
        );
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        temp_env::with_var(MAX_CONCURRENCY_ENV, Some("0"), || {
            let err = Settings::default().apply_env_overrides().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { .. }));
        });
        temp_env::with_var(MAX_CONCURRENCY_ENV, Some("many"), || {
            let err = Settings::default().apply_env_overrides().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { .. }));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "max_concurrency: 3").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let found = temp_env::with_var_unset(CONFIG_PATH_ENV, find_config_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(found.unwrap().unwrap().ends_with(CONFIG_FILE_NAME));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let dot_dir = temp_dir.path().join(".infraflow");
        fs::create_dir(&dot_dir).unwrap();
        fs::write(dot_dir.join(CONFIG_FILE_NAME), "").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let found = temp_env::with_var_unset(CONFIG_PATH_ENV, find_config_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(found.unwrap().unwrap().ends_with(".infraflow/infraflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_env_path_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "step_timeout_secs: 60").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(config_path.to_str().unwrap())),
                (STATE_DIR_ENV, None),
                (MAX_CONCURRENCY_ENV, None),
            ],
            || {
                assert_eq!(find_config_file().unwrap(), Some(config_path.clone()));
                assert_eq!(load_settings().unwrap().step_timeout_secs, 60);
            },
        );
    }
}
