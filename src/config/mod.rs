//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/scope_cal.toml` (base configuration)
//! 2. Environment variables (prefixed with `SCOPECAL_`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SCOPECAL_APPLICATION_SIMULATE=true
//! SCOPECAL_INSTRUMENTS_UUT=GPIB0::7::INSTR
//! SCOPECAL_RUN_PARALLEL=true
//! ```
//!
//! Nested keys are split on `_`, so field names in this module avoid
//! underscores wherever an environment override is expected to be useful.
//!
//! # Example
//!
//! ```no_run
//! use scope_cal::config::Settings;
//!
//! let settings = Settings::load().unwrap();
//! println!("UUT: {}", settings.instruments.uut);
//! ```

use crate::instrument::calibrator::is_m142;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// VISA resources of the bench instruments
    pub instruments: InstrumentsConfig,
    /// Results workbook layout
    pub workbook: WorkbookConfig,
    /// Defaults for a test run
    pub run: RunConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Drive simulated instruments instead of VISA resources
    pub simulate: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Oscilloscope Calibration".to_string(),
            log_level: default_log_level(),
            simulate: false,
        }
    }
}

/// Instrument addresses and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    /// DC calibrator model: 5700A, 5720A, 5730A or M142 (M-142)
    pub calibrator: String,
    /// Calibrator VISA resource
    pub calres: String,
    /// Keysight 33250A function generator resource
    pub fgen: String,
    /// RF signal generator resource (E4438C, E8257D, N5183A)
    pub rfgen: String,
    /// Keysight 3458A multimeter resource
    pub dmm: String,
    /// Oscilloscope under test
    pub uut: String,
    /// I/O timeout in milliseconds
    pub timeout: u64,
    /// Calibrator settle polls before giving up
    pub settle: u32,
    /// `*IDN?` reply of the simulated UUT
    pub simidn: String,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            calibrator: "5730A".to_string(),
            calres: "GPIB0::4::INSTR".to_string(),
            fgen: "GPIB0::10::INSTR".to_string(),
            rfgen: "GPIB0::19::INSTR".to_string(),
            dmm: "GPIB0::22::INSTR".to_string(),
            uut: "GPIB0::7::INSTR".to_string(),
            timeout: default_timeout_ms(),
            settle: default_settle_polls(),
            simidn: crate::simulation::DEFAULT_UUT_IDN.to_string(),
        }
    }
}

impl InstrumentsConfig {
    /// I/O timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Whether the configured calibrator is the Meatest M-142.
    pub fn uses_m142(&self) -> bool {
        is_m142(&self.calibrator)
    }
}

/// Results workbook layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbookConfig {
    /// First column of per-row test settings (1-based)
    pub datacol: u32,
    /// Default results column (1-based)
    pub resultcol: u32,
    /// Column carrying the units of each result (1-based)
    pub unitscol: u32,
    /// Row to start from when the workbook does not say otherwise
    pub startrow: u32,
    /// Last row scanned for tests
    pub maxrow: u32,
    /// Named range marking the first test row
    pub startcell: String,
    /// Named range receiving the instrument age after the timebase test
    pub agecell: String,
    /// Named ranges for backends without native defined names (name -> A1 cell)
    pub names: HashMap<String, String>,
    /// Directory for timestamped backups, relative to the workbook
    pub backups: PathBuf,
}

impl Default for WorkbookConfig {
    fn default() -> Self {
        Self {
            datacol: 10,
            resultcol: 4,
            unitscol: 6,
            startrow: 10,
            maxrow: 1000,
            startcell: "StartCell".to_string(),
            agecell: "Age".to_string(),
            names: HashMap::new(),
            backups: PathBuf::from("Backups"),
        }
    }
}

/// Defaults for a calibration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Skip rows that already carry a result
    pub skip: bool,
    /// All channels are driven from one calibrator output through a splitter
    pub parallel: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            skip: true,
            parallel: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_settle_polls() -> u32 {
    15
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

/// Calibrator models the sequencer knows how to drive.
pub const CALIBRATOR_MODELS: [&str; 4] = ["5700A", "5720A", "5730A", "M142"];

impl Settings {
    /// Load configuration from `config/scope_cal.toml` and environment variables
    ///
    /// Configuration is loaded in this order of precedence (highest to lowest):
    /// 1. Environment variables (`SCOPECAL_` prefix)
    /// 2. `config/scope_cal.toml`
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/scope_cal.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCOPECAL_").split("_"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Calibrator model is one we have a driver for
    /// - Workbook columns are 1-based and the row window is not empty
    /// - Named ranges given for CSV workbooks are valid A1 coordinates
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let model = self.instruments.calibrator.to_ascii_uppercase().replace('-', "");
        if !CALIBRATOR_MODELS.contains(&model.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid calibrator '{}'. Must be one of: {}",
                self.instruments.calibrator,
                CALIBRATOR_MODELS.join(", ")
            )));
        }

        if self.instruments.timeout == 0 {
            return Err(ConfigError::ValidationError(
                "Instrument timeout must be greater than zero".to_string(),
            ));
        }

        let wb = &self.workbook;
        for (name, col) in [
            ("datacol", wb.datacol),
            ("resultcol", wb.resultcol),
            ("unitscol", wb.unitscol),
        ] {
            if col == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Workbook column '{}' is 1-based and cannot be 0",
                    name
                )));
            }
        }

        if wb.startrow == 0 || wb.startrow >= wb.maxrow {
            return Err(ConfigError::ValidationError(format!(
                "Invalid row window: startrow {} must be between 1 and maxrow {}",
                wb.startrow, wb.maxrow
            )));
        }

        for (name, cell) in &wb.names {
            if crate::workbook::parse_coordinate(cell).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Named range '{}' has invalid cell reference '{}'",
                    name, cell
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();

        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_calibrator() {
        let mut settings = Settings::default();
        settings.instruments.calibrator = "9100".to_string();

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid calibrator"));
    }

    #[test]
    fn test_calibrator_case_insensitive() {
        let mut settings = Settings::default();
        settings.instruments.calibrator = "m142".to_string();
        assert!(settings.validate().is_ok());
        assert!(settings.instruments.uses_m142());

        settings.instruments.calibrator = "M-142".to_string();
        assert!(settings.validate().is_ok());
        assert!(settings.instruments.uses_m142());
    }

    #[test]
    fn test_zero_column_rejected() {
        let mut settings = Settings::default();
        settings.workbook.resultcol = 0;

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("resultcol"));
    }

    #[test]
    fn test_empty_row_window_rejected() {
        let mut settings = Settings::default();
        settings.workbook.startrow = 1000;

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("row window"));
    }

    #[test]
    fn test_bad_named_range_rejected() {
        let mut settings = Settings::default();
        settings
            .workbook
            .names
            .insert("StartCell".to_string(), "12J".to_string());

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("StartCell"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
simulate = true

[instruments]
calibrator = "M142"
uut = "USB0::0x0957::0x179B::MY51250123::INSTR"

[workbook]
datacol = 12

[workbook.names]
StartCell = "L14"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert!(settings.application.simulate);
        assert!(settings.instruments.uses_m142());
        assert_eq!(settings.workbook.datacol, 12);
        assert_eq!(settings.workbook.resultcol, 4);
        assert_eq!(settings.workbook.names.get("StartCell").unwrap(), "L14");
        assert_eq!(settings.instruments.timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.workbook.startrow, 10);
        assert!(settings.run.skip);
    }
}
