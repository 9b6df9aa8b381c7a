use crate::defaults;
use crate::error::LevelflowError;
use crate::level::{HangPolicy, Padding};
use crate::pipeline::{LevelPolicy, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSection,
    pub levels: LevelsSection,
    pub demo: DemoSection,
}

/// Tick loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSection {
    /// 0 = unlimited
    pub max_ticks: u64,
    pub repeat_eoi_passes: bool,
    pub external_wait_ms: u64,
    pub pause_retry_rounds: u32,
    pub configure_passes: u32,
}

/// Defaults for every level, plus per-level overrides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LevelsSection {
    pub capacity_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hang: Option<HangPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub padding: Option<Padding>,
    pub overrides: BTreeMap<String, LevelPolicy>,
}

/// Settings of the pipeline built by `levelflow run`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoSection {
    /// Humantime duration, e.g. "25ms"
    pub frame_size: String,
    pub frame_step: String,
    /// Sample rate of raw PCM read from stdin
    pub sample_rate: u32,
    pub turn_threshold: f64,
    pub turn_min_frames: usize,
    pub turn_gap_frames: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_ticks: 0,
            repeat_eoi_passes: false,
            external_wait_ms: defaults::EXTERNAL_WAIT_MS,
            pause_retry_rounds: defaults::PAUSE_RETRY_ROUNDS,
            configure_passes: defaults::CONFIGURE_PASSES,
        }
    }
}

impl Default for LevelsSection {
    fn default() -> Self {
        Self {
            capacity_sec: defaults::CAPACITY_SEC,
            growable: None,
            ring: None,
            hang: None,
            padding: None,
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for DemoSection {
    fn default() -> Self {
        Self {
            frame_size: format_ms(defaults::FRAME_SIZE_SEC),
            frame_step: format_ms(defaults::FRAME_STEP_SEC),
            sample_rate: defaults::SAMPLE_RATE,
            turn_threshold: defaults::TURN_THRESHOLD,
            turn_min_frames: defaults::TURN_MIN_FRAMES,
            turn_gap_frames: defaults::TURN_GAP_FRAMES,
        }
    }
}

fn format_ms(sec: f64) -> String {
    format!("{}ms", (sec * 1000.0).round() as u64)
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, LevelflowError> {
    let duration =
        humantime::parse_duration(value).map_err(|e| LevelflowError::ConfigInvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        })?;
    if duration.is_zero() {
        return Err(LevelflowError::ConfigInvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}

impl DemoSection {
    pub fn frame_size(&self) -> Result<Duration, LevelflowError> {
        parse_duration("demo.frame_size", &self.frame_size)
    }

    pub fn frame_step(&self) -> Result<Duration, LevelflowError> {
        parse_duration("demo.frame_step", &self.frame_step)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - LEVELFLOW_MAX_TICKS → scheduler.max_ticks
    /// - LEVELFLOW_CAPACITY_SEC → levels.capacity_sec
    /// - LEVELFLOW_GROWABLE → levels.growable
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_value::<u64>("LEVELFLOW_MAX_TICKS") {
            self.scheduler.max_ticks = v;
        }
        if let Some(v) = env_value::<f64>("LEVELFLOW_CAPACITY_SEC") {
            self.levels.capacity_sec = v;
        }
        if let Ok(v) = std::env::var("LEVELFLOW_GROWABLE")
            && !v.is_empty()
        {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.levels.growable = Some(true),
                "0" | "false" | "no" | "off" => self.levels.growable = Some(false),
                other => warn!("ignoring LEVELFLOW_GROWABLE={other}: expected a boolean"),
            }
        }
        self
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), LevelflowError> {
        let positive = |key: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(LevelflowError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("{v} is not a positive number"),
                })
            }
        };
        positive("levels.capacity_sec", self.levels.capacity_sec)?;
        for (name, policy) in &self.levels.overrides {
            if let Some(sec) = policy.capacity_sec {
                positive(&format!("levels.overrides.{name}.capacity_sec"), sec)?;
            }
        }
        if self.demo.sample_rate == 0 {
            return Err(LevelflowError::ConfigInvalidValue {
                key: "demo.sample_rate".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        self.demo.frame_size()?;
        self.demo.frame_step()?;
        Ok(())
    }

    /// Scheduler and level settings for [`Pipeline::new`](crate::pipeline::Pipeline::new).
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_ticks: self.scheduler.max_ticks,
            repeat_eoi_passes: self.scheduler.repeat_eoi_passes,
            external_wait: Duration::from_millis(self.scheduler.external_wait_ms),
            pause_retry_rounds: self.scheduler.pause_retry_rounds,
            configure_passes: self.scheduler.configure_passes,
            capacity_sec: self.levels.capacity_sec,
            levels: LevelPolicy {
                growable: self.levels.growable,
                ring: self.levels.ring,
                hang: self.levels.hang,
                padding: self.levels.padding,
                ..LevelPolicy::default()
            },
            overrides: self.levels.overrides.clone(),
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/levelflow/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("levelflow")
            .join("config.toml")
    }
}

fn env_value<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok().filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_levelflow_env() {
        remove_env("LEVELFLOW_MAX_TICKS");
        remove_env("LEVELFLOW_CAPACITY_SEC");
        remove_env("LEVELFLOW_GROWABLE");
    }

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(contents.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.scheduler.max_ticks, 0);
        assert!(!config.scheduler.repeat_eoi_passes);
        assert_eq!(config.scheduler.external_wait_ms, 50);
        assert_eq!(config.levels.capacity_sec, 2.0);
        assert_eq!(config.levels.growable, None);
        assert!(config.levels.overrides.is_empty());
        assert_eq!(config.demo.frame_size, "25ms");
        assert_eq!(config.demo.frame_step, "10ms");
        assert_eq!(config.demo.sample_rate, 16000);
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_file = write_temp(
            r#"
            [scheduler]
            max_ticks = 500
            repeat_eoi_passes = true
            external_wait_ms = 5

            [levels]
            capacity_sec = 4.0
            hang = "never-hang"
            padding = "zero"

            [levels.overrides.energy]
            capacity = 64
            growable = true

            [demo]
            frame_size = "32ms"
            frame_step = "16ms"
            turn_min_frames = 3
        "#,
        );

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.scheduler.max_ticks, 500);
        assert!(config.scheduler.repeat_eoi_passes);
        assert_eq!(config.scheduler.external_wait_ms, 5);
        assert_eq!(config.levels.capacity_sec, 4.0);
        assert_eq!(config.levels.hang, Some(HangPolicy::NeverHang));
        assert_eq!(config.levels.padding, Some(Padding::Zero));
        let energy = &config.levels.overrides["energy"];
        assert_eq!(energy.capacity, Some(64));
        assert_eq!(energy.growable, Some(true));
        assert_eq!(config.demo.frame_size().unwrap(), Duration::from_millis(32));
        assert_eq!(config.demo.frame_step().unwrap(), Duration::from_millis(16));
        assert_eq!(config.demo.turn_min_frames, 3);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let temp_file = write_temp(
            r#"
            [scheduler]
            max_ticks = 7
        "#,
        );

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.scheduler.max_ticks, 7);
        assert_eq!(config.levels, LevelsSection::default());
        assert_eq!(config.demo, DemoSection::default());
    }

    #[test]
    fn test_pipeline_config_carries_policies() {
        let mut config = Config::default();
        config.scheduler.external_wait_ms = 0;
        config.levels.capacity_sec = 3.5;
        config.levels.ring = Some(false);
        config.levels.overrides.insert(
            "pcm".to_string(),
            LevelPolicy {
                growable: Some(true),
                ..LevelPolicy::default()
            },
        );

        let pipeline = config.pipeline_config();
        assert!(pipeline.external_wait.is_zero());
        assert_eq!(pipeline.capacity_sec, 3.5);
        assert_eq!(pipeline.levels.ring, Some(false));
        let pcm = pipeline.policy_for("pcm");
        assert_eq!(pcm.ring, Some(false));
        assert_eq!(pcm.growable, Some(true));
        assert_eq!(pipeline.policy_for("energy").growable, None);
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_levelflow_env();

        set_env("LEVELFLOW_MAX_TICKS", "1000");
        set_env("LEVELFLOW_CAPACITY_SEC", "0.5");
        set_env("LEVELFLOW_GROWABLE", "yes");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.scheduler.max_ticks, 1000);
        assert_eq!(config.levels.capacity_sec, 0.5);
        assert_eq!(config.levels.growable, Some(true));

        clear_levelflow_env();
    }

    #[test]
    fn test_env_override_invalid_or_empty_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_levelflow_env();

        set_env("LEVELFLOW_MAX_TICKS", "");
        set_env("LEVELFLOW_CAPACITY_SEC", "lots");
        set_env("LEVELFLOW_GROWABLE", "maybe");
        let config = Config::default().with_env_overrides();

        assert_eq!(config, Config::default());

        clear_levelflow_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.demo.frame_step = "0ms".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("demo.frame_step"));

        config.demo.frame_step = "fast".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.levels.capacity_sec = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let temp_file = write_temp(
            r#"
            [scheduler
            max_ticks = "broken
        "#,
        );

        assert!(Config::load(temp_file.path()).is_err());
        let err = Config::load_or_default(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_default_path_ends_with_levelflow_config() {
        let path = Config::default_path();
        assert!(path.ends_with("levelflow/config.toml"));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serialized_config_loads_back() {
        let mut config = Config::default();
        config.levels.hang = Some(HangPolicy::Hang);
        let text = toml::to_string_pretty(&config).unwrap();
        let temp_file = write_temp(&text);
        assert_eq!(Config::load(temp_file.path()).unwrap(), config);
    }
}
