//! Keysight (HP) 3458A digital multimeter.
//!
//! The 3458A predates SCPI: it identifies with `ID?`, resets with `RESET`,
//! and has no `*OPC`. Triggered readings are read back one per line after
//! `TARM SGL`.

use super::identity::Identity;
use super::session::{parse_number, ScpiSession, IDN_TIMEOUT};
use crate::error::{AppResult, CalError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default I/O timeout; ACV doubles it.
pub const DMM_TIMEOUT: Duration = Duration::from_millis(15000);

/// Measurement functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmmFunction {
    Dcv,
    Acv,
    /// 2-wire resistance
    Ohm2W,
    /// 4-wire resistance
    Ohm4W,
    Dci,
    Aci,
}

impl DmmFunction {
    pub fn as_command(&self) -> &'static str {
        match self {
            Self::Dcv => "DCV",
            Self::Acv => "ACV",
            Self::Ohm2W => "OHM",
            Self::Ohm4W => "OHMF",
            Self::Dci => "DCI",
            Self::Aci => "ACI",
        }
    }
}

/// DCV input resistance. 10 GΩ is only available up to the 10 V range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputResistance {
    TenMegaohm,
    TenGigaohm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcvConfig {
    Default,
    /// Synchronous sampling, line filter, 0.002 % resolution.
    Best,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcvSync {
    Analog,
    Sync,
    Random,
}

/// Digitising resolution for [`Ks3458A::measure_sampling`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleResolution {
    /// 4.5 digits, 16-bit `SINT` samples
    Digits4_5,
    /// 5.5 digits, 32-bit `DINT` samples
    Digits5_5,
}

impl SampleResolution {
    pub fn format(&self) -> &'static str {
        match self {
            Self::Digits4_5 => "SINT",
            Self::Digits5_5 => "DINT",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Digits4_5 => 2,
            Self::Digits5_5 => 4,
        }
    }

    /// Reading memory: 20 kB standard, 148 kB with option 001.
    pub fn max_samples(&self, option_001: bool) -> usize {
        match (self, option_001) {
            (Self::Digits4_5, false) => 10240,
            (Self::Digits5_5, false) => 5120,
            (Self::Digits4_5, true) => 75776,
            (Self::Digits5_5, true) => 37888,
        }
    }
}

/// Mean and population standard deviation of a block of readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingStats {
    pub average: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl ReadingStats {
    /// `None` when `readings` is empty.
    pub fn from_readings(readings: &[f64]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let n = readings.len() as f64;
        let average = readings.iter().sum::<f64>() / n;
        let variance = readings.iter().map(|r| (r - average).powi(2)).sum::<f64>() / n;
        Some(Self {
            average,
            std_dev: variance.sqrt(),
            count: readings.len(),
        })
    }
}

/// Decode big-endian signed samples and apply the `ISCALE?` factor.
pub fn decode_samples(raw: &[u8], resolution: SampleResolution, scale: f64) -> Vec<f64> {
    let size = resolution.bytes_per_sample();
    raw.chunks_exact(size)
        .map(|chunk| {
            let counts = match resolution {
                SampleResolution::Digits4_5 => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
                SampleResolution::Digits5_5 => {
                    i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
                }
            };
            counts * scale
        })
        .collect()
}

pub struct Ks3458A {
    session: ScpiSession,
    identity: Identity,
    timeout: Duration,
    current_function: Option<DmmFunction>,
    option_001: bool,
}

impl Ks3458A {
    pub async fn connect(mut session: ScpiSession) -> AppResult<Self> {
        let reply = session.query_with_timeout("ID?", IDN_TIMEOUT).await?;
        let identity = Identity {
            manufacturer: "Keysight".to_string(),
            model: reply.trim().to_string(),
            ..Default::default()
        };
        info!(resource = %session.resource_name(), "DMM: {}", identity.model);
        session.set_timeout(DMM_TIMEOUT);
        Ok(Self {
            session,
            identity,
            timeout: DMM_TIMEOUT,
            current_function: None,
            option_001: false,
        })
    }

    /// Declare the extended reading memory (option 001). The 3458A has no
    /// query for installed options.
    pub fn with_option_001(mut self, installed: bool) -> Self {
        self.option_001 = installed;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_expected_model(&self) -> bool {
        self.session.is_simulating() || self.identity.model.contains("3458")
    }

    pub async fn reset(&mut self) -> AppResult<()> {
        self.current_function = None;
        self.session.write("RESET").await
    }

    pub async fn set_input_resistance(&mut self, resistance: InputResistance) -> AppResult<()> {
        let fixed = match resistance {
            InputResistance::TenMegaohm => "ON",
            InputResistance::TenGigaohm => "OFF",
        };
        self.session.write(&format!("FIXEDZ {};", fixed)).await
    }

    pub async fn set_function(&mut self, function: DmmFunction) -> AppResult<()> {
        // ACV readings take much longer to come back.
        let timeout = if function == DmmFunction::Acv {
            self.timeout * 2
        } else {
            self.timeout
        };
        self.session.set_timeout(timeout);
        self.session.write(function.as_command()).await?;
        self.current_function = Some(function);
        Ok(())
    }

    pub async fn configure_dc_nplc(&mut self, nplc: u32) -> AppResult<()> {
        self.session.write(&format!("NPLC {}", nplc)).await
    }

    pub async fn configure_acv(&mut self, config: AcvConfig) -> AppResult<()> {
        if config == AcvConfig::Best {
            self.session.write("SETACV SYNC").await?;
            self.session.write("LFILTER ON").await?;
            self.session.write("RES 0.002").await?;
        }
        Ok(())
    }

    pub async fn set_acv_sync_mode(&mut self, mode: AcvSync) -> AppResult<()> {
        let cmd = match mode {
            AcvSync::Analog => "ANA",
            AcvSync::Sync => "SYNC",
            AcvSync::Random => "RNDM",
        };
        self.session.write(&format!("SETACV {}", cmd)).await
    }

    /// Take `readings` triggered readings of `function`.
    ///
    /// One extra reading is triggered and discarded. Readings that do not
    /// parse are skipped.
    pub async fn measure(&mut self, function: DmmFunction, readings: u32) -> AppResult<ReadingStats> {
        if self.current_function != Some(function) {
            self.set_function(function).await?;
        }
        self.session
            .write(&format!("NRDGS {}", readings + 1))
            .await?;
        self.session.write("TARM SGL").await?;
        if let Err(e) = self.session.read().await {
            debug!("Dummy reading failed: {}", e);
        }

        let mut values = Vec::with_capacity(readings as usize);
        for _ in 0..readings {
            let reply = self.session.read().await?;
            match parse_number(&reply) {
                Some(v) => values.push(v),
                None => warn!("Skipping unparsable 3458A reading '{}'", reply.trim()),
            }
        }
        self.session.write("NRDGS 1").await?;

        let stats = ReadingStats::from_readings(&values).ok_or_else(|| CalError::InvalidResponse {
            command: "TARM SGL".into(),
            response: "no numeric readings".into(),
        })?;
        debug!(average = stats.average, std_dev = stats.std_dev, "3458A {:?}", function);
        Ok(stats)
    }

    /// Back to free-running readings after [`measure`](Self::measure).
    pub async fn continuous_measure(&mut self) -> AppResult<()> {
        self.session.write("NRDGS 1").await?;
        self.session.write("TARM AUTO").await
    }

    /// Digitise `samples` DC voltage readings `period` seconds apart.
    pub async fn measure_sampling(
        &mut self,
        period: f64,
        samples: usize,
        resolution: SampleResolution,
    ) -> AppResult<Vec<f64>> {
        let max = resolution.max_samples(self.option_001);
        if samples > max {
            return Err(CalError::InvalidArgument(format!(
                "{} samples exceeds the 3458A memory of {} readings",
                samples, max
            )));
        }

        for cmd in [
            "PRESET DIG",
            "TRIG AUTO",
            "DSDC 10",
            "APER 1.4E-6",
            // Direct transfer cannot keep up with the sample rate.
            "MEM FIFO",
            "DISP OFF",
        ] {
            self.session.write(cmd).await?;
        }
        self.session.write(&format!("TIMER {}", period)).await?;
        self.session
            .write(&format!("NRDGS {}, TIMER", samples))
            .await?;
        self.session.write("AZERO OFF").await?;
        self.session
            .write(&format!("MFORMAT {}", resolution.format()))
            .await?;
        self.session
            .write(&format!("OFORMAT {}", resolution.format()))
            .await?;
        self.session.write("TARM SGL").await?;

        self.session.set_timeout(Duration::from_millis(2000));
        let raw = self
            .session
            .read_bytes(samples * resolution.bytes_per_sample())
            .await;
        let scale = match raw {
            Ok(_) => self.session.read_query("ISCALE?").await,
            Err(_) => Ok(0.0),
        };
        self.session.set_timeout(self.timeout);
        let raw = raw?;
        let scale = scale?;
        self.session.write("DISP ON").await?;
        self.current_function = None;

        Ok(decode_samples(&raw, resolution, scale))
    }

    pub async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}
