use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{plog_debug, Error, Result};

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_STALL_THRESHOLD: u32 = 2;
pub const DEFAULT_STALL_SIMILARITY: f64 = 0.9;
pub const DEFAULT_TREND_THRESHOLD: f64 = 0.05;
pub const DEFAULT_PASS_SCORE: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Use the in-process demo transport instead of a real agent process.
    #[serde(default)]
    pub demo: bool,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub reflection: ReflectionSettings,
}

/// Timer and timeout values for the watchdog, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub check_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub tool_timeout_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

impl WatchdogSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// The scan interval must be shorter than the shortest timeout it
    /// enforces, and the tool timeout must exceed the base timeout.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(Error::Validation(
                "watchdog check interval must be non-zero".to_string(),
            ));
        }
        if self.check_interval_secs >= self.inactivity_timeout_secs {
            return Err(Error::Validation(format!(
                "watchdog check interval ({}s) must be less than inactivity timeout ({}s)",
                self.check_interval_secs, self.inactivity_timeout_secs
            )));
        }
        if self.tool_timeout_secs <= self.inactivity_timeout_secs {
            return Err(Error::Validation(format!(
                "tool timeout ({}s) must be greater than inactivity timeout ({}s)",
                self.tool_timeout_secs, self.inactivity_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Defaults applied to new reflection cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionSettings {
    pub max_iterations: u32,
    /// Consecutive stalls that end a cycle.
    pub stall_threshold: u32,
    /// Jaccard similarity above which two responses count as a stall.
    pub stall_similarity: f64,
    /// Minimum score delta for a trend to count as improving or degrading.
    pub trend_threshold: f64,
    /// Score at or above which a scored evaluation passes.
    pub pass_score: f64,
}

impl Default for ReflectionSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            stall_similarity: DEFAULT_STALL_SIMILARITY,
            trend_threshold: DEFAULT_TREND_THRESHOLD,
            pass_score: DEFAULT_PASS_SCORE,
        }
    }
}

impl ReflectionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Validation(
                "reflection max_iterations must be at least 1".to_string(),
            ));
        }
        if self.stall_threshold == 0 {
            return Err(Error::Validation(
                "reflection stall_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.stall_similarity > 0.0 && self.stall_similarity <= 1.0) {
            return Err(Error::Validation(format!(
                "reflection stall_similarity ({}) must be in (0, 1]",
                self.stall_similarity
            )));
        }
        if !(0.0..=1.0).contains(&self.pass_score) {
            return Err(Error::Validation(format!(
                "reflection pass_score ({}) must be in [0, 1]",
                self.pass_score
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".polyphon"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("polyphon.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("organization.json"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        plog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            plog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml(&fs::read_to_string(&path)?)?;
        plog_debug!(
            "Config loaded: demo={} watchdog={:?} reflection={:?}",
            config.demo,
            config.watchdog,
            config.reflection
        );
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.watchdog.validate()?;
        self.reflection.validate()
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::home_dir()?;
        if !dir.exists() {
            plog_debug!("Creating config directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        plog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
