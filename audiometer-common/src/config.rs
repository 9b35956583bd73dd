//! Configuration loading and validation
//!
//! Two layers:
//! 1. [`TestConfiguration`] - the values consumed by the threshold search
//!    (frequencies, ears, levels, steps, timing, guards). Immutable once a
//!    session starts.
//! 2. [`AppConfig`] - bootstrap settings read from TOML (results folder,
//!    database path, HTTP port, logging) wrapping a `[test]` table.
//!
//! Resolution priority:
//! 1. Command-line arguments (applied by the binary)
//! 2. Environment variables (`AUDIOMETER_CONFIG`, `AUDIOMETER_RESULTS_DIR`)
//! 3. TOML config file
//! 4. Compiled defaults

use crate::types::Ear;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "AUDIOMETER_CONFIG";

/// Environment variable overriding the results folder
pub const RESULTS_DIR_ENV: &str = "AUDIOMETER_RESULTS_DIR";

/// Highest level any configuration may allow as safety ceiling
pub const MAX_SAFETY_CEILING_DB: i32 = 120;

/// Frequency sets offered by the test front-ends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyPreset {
    /// Full clinical set, 125 Hz - 8 kHz
    Standard,
    /// Quick screening set
    Quick,
    /// Ultra quick set
    Mini,
}

impl FrequencyPreset {
    pub fn frequencies(self) -> Vec<u32> {
        match self {
            FrequencyPreset::Standard => vec![
                125, 250, 500, 750, 1000, 1500, 2000, 3000, 4000, 6000, 8000,
            ],
            FrequencyPreset::Quick => vec![1000, 2000, 4000, 500],
            FrequencyPreset::Mini => vec![1000, 4000],
        }
    }
}

impl std::str::FromStr for FrequencyPreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(FrequencyPreset::Standard),
            "quick" => Ok(FrequencyPreset::Quick),
            "mini" => Ok(FrequencyPreset::Mini),
            other => Err(format!("unknown frequency preset '{}'", other)),
        }
    }
}

/// Relative output reference for one frequency
///
/// Output gain in dBFS = `reference_dbfs + correction_db + level_dbhl`.
/// These are relative offsets for the sound card, not an absolute SPL
/// calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReferenceLevel {
    pub frequency_hz: u32,
    pub reference_dbfs: f64,
    pub correction_db: f64,
}

fn default_reference_levels() -> Vec<ReferenceLevel> {
    [
        (125, -81.0, 17.0),
        (250, -92.0, 12.0),
        (500, -80.0, -5.0),
        (750, -85.0, -3.0),
        (1000, -84.0, -4.0),
        (1500, -82.0, -4.0),
        (2000, -90.0, 2.0),
        (3000, -94.0, 10.0),
        (4000, -91.0, 11.0),
        (6000, -70.0, -5.0),
        (8000, -76.0, 1.0),
    ]
    .into_iter()
    .map(|(frequency_hz, reference_dbfs, correction_db)| ReferenceLevel {
        frequency_hz,
        reference_dbfs,
        correction_db,
    })
    .collect()
}

/// Audio output settings for the tone generator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    /// Output device name (None = system default)
    pub device: Option<String>,
    /// Onset ramp in milliseconds
    pub attack_ms: f64,
    /// Offset ramp in milliseconds
    pub release_ms: f64,
    /// dBHL → dBFS offsets per frequency
    pub reference_levels: Vec<ReferenceLevel>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            device: None,
            attack_ms: 30.0,
            release_ms: 40.0,
            reference_levels: default_reference_levels(),
        }
    }
}

impl OutputSettings {
    /// Output gain in dBFS for a hearing level, `None` if the frequency has no reference
    pub fn dbhl_to_dbfs(&self, frequency_hz: u32, level_db: i32) -> Option<f64> {
        self.reference_levels
            .iter()
            .find(|r| r.frequency_hz == frequency_hz)
            .map(|r| r.reference_dbfs + r.correction_db + level_db as f64)
    }
}

/// Threshold test configuration
///
/// Immutable once a session starts. Call [`TestConfiguration::validate`]
/// before handing it to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfiguration {
    /// Frequencies in presentation order (Hz)
    pub frequencies: Vec<u32>,
    /// Ears to test; the first entry is tested first unless shuffled
    pub ears: Vec<Ear>,
    /// Familiarization start level (dBHL)
    pub start_level_db: i32,
    /// Ascending step (dB)
    pub small_step_db: i32,
    /// Bracketing step (dB)
    pub large_step_db: i32,
    /// Tone hold duration (seconds)
    pub tone_duration_secs: f64,
    /// Extra wait after the tone for late responses (seconds)
    pub tolerance_secs: f64,
    /// Inter-stimulus pause interval, lower bound (seconds)
    pub pause_min_secs: f64,
    /// Inter-stimulus pause interval, upper bound (seconds)
    pub pause_max_secs: f64,
    /// Maximum presentation level (dBHL)
    pub safety_ceiling_db: i32,
    /// Presentation cap per (ear, frequency)
    pub max_presentations: u32,
    /// Shuffle ear order per session
    pub randomize_ear_order: bool,
    /// Tone generator settings
    pub output: OutputSettings,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            frequencies: FrequencyPreset::Quick.frequencies(),
            ears: vec![Ear::Right, Ear::Left],
            start_level_db: 40,
            small_step_db: 5,
            large_step_db: 10,
            tone_duration_secs: 2.0,
            tolerance_secs: 1.5,
            pause_min_secs: 2.0,
            pause_max_secs: 3.0,
            safety_ceiling_db: 80,
            max_presentations: 60,
            randomize_ear_order: true,
            output: OutputSettings::default(),
        }
    }
}

impl TestConfiguration {
    pub fn tone_duration(&self) -> Duration {
        Duration::from_secs_f64(self.tone_duration_secs)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_secs_f64(self.tolerance_secs)
    }

    pub fn pause_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs_f64(self.pause_min_secs),
            Duration::from_secs_f64(self.pause_max_secs),
        )
    }

    /// Number of (ear, frequency) combinations
    pub fn combination_count(&self) -> usize {
        self.ears.len() * self.frequencies.len()
    }

    /// Replace the frequency list with a preset
    pub fn with_preset(mut self, preset: FrequencyPreset) -> Self {
        self.frequencies = preset.frequencies();
        self
    }

    /// Check every field before a session starts
    ///
    /// # Errors
    /// [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.frequencies.is_empty() {
            return Err(Error::Config("frequency list is empty".to_string()));
        }
        if self.frequencies.contains(&0) {
            return Err(Error::Config("frequencies must be positive".to_string()));
        }
        let unique: HashSet<_> = self.frequencies.iter().collect();
        if unique.len() != self.frequencies.len() {
            return Err(Error::Config("frequency list contains duplicates".to_string()));
        }

        if self.ears.is_empty() {
            return Err(Error::Config("ear list is empty".to_string()));
        }
        let unique: HashSet<_> = self.ears.iter().collect();
        if unique.len() != self.ears.len() {
            return Err(Error::Config("ear list contains duplicates".to_string()));
        }

        if self.small_step_db <= 0 || self.large_step_db <= 0 {
            return Err(Error::Config(format!(
                "steps must be positive (small={}, large={})",
                self.small_step_db, self.large_step_db
            )));
        }
        if self.small_step_db > self.large_step_db {
            return Err(Error::Config(format!(
                "small step {} dB exceeds large step {} dB",
                self.small_step_db, self.large_step_db
            )));
        }

        if self.safety_ceiling_db <= 0 || self.safety_ceiling_db > MAX_SAFETY_CEILING_DB {
            return Err(Error::Config(format!(
                "safety ceiling {} dBHL outside (0, {}]",
                self.safety_ceiling_db, MAX_SAFETY_CEILING_DB
            )));
        }
        if self.start_level_db < 0 || self.start_level_db > self.safety_ceiling_db {
            return Err(Error::Config(format!(
                "start level {} dBHL outside [0, {}]",
                self.start_level_db, self.safety_ceiling_db
            )));
        }

        if !self.tone_duration_secs.is_finite() || self.tone_duration_secs <= 0.0 {
            return Err(Error::Config(format!(
                "tone duration must be positive, got {}",
                self.tone_duration_secs
            )));
        }
        if !self.tolerance_secs.is_finite() || self.tolerance_secs < 0.0 {
            return Err(Error::Config(format!(
                "tolerance must not be negative, got {}",
                self.tolerance_secs
            )));
        }
        if !self.pause_min_secs.is_finite()
            || !self.pause_max_secs.is_finite()
            || self.pause_min_secs < 0.0
            || self.pause_min_secs > self.pause_max_secs
        {
            return Err(Error::Config(format!(
                "invalid pause interval [{}, {}]",
                self.pause_min_secs, self.pause_max_secs
            )));
        }

        if self.max_presentations == 0 {
            return Err(Error::Config("max_presentations must be at least 1".to_string()));
        }

        if self.output.attack_ms <= 0.0 || self.output.release_ms <= 0.0 {
            return Err(Error::Config(
                "attack and release have to be positive and different from zero".to_string(),
            ));
        }
        for freq in &self.frequencies {
            if self.output.dbhl_to_dbfs(*freq, 0).is_none() {
                return Err(Error::Config(format!(
                    "no output reference level for {} Hz",
                    freq
                )));
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
        }
    }
}

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Folder receiving result files
    pub results_dir: PathBuf,
    /// SQLite history database (None = history disabled)
    pub database_path: Option<PathBuf>,
    /// HTTP control port
    pub port: u16,
    pub logging: LoggingConfig,
    pub test: TestConfiguration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            database_path: None,
            port: 5750,
            logging: LoggingConfig::default(),
            test: TestConfiguration::default(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load configuration following the priority order
    ///
    /// A missing config file is not an error: a warning is logged and
    /// compiled defaults are used. An unreadable or malformed file is.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml_str(&content)?
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Self::default()
            }
            None => {
                warn!("Could not determine config directory, using compiled defaults");
                Self::default()
            }
        };

        if let Ok(dir) = std::env::var(RESULTS_DIR_ENV) {
            config.results_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

/// Default config file path: `<config dir>/audiometer/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("audiometer").join("config.toml"))
}

/// OS-dependent default results folder
pub fn default_results_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("audiometer").join("results"))
        .unwrap_or_else(|| PathBuf::from("./audiometer_results"))
}
