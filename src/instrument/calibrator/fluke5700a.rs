//! Fluke 5700A/5720A/5730A multifunction calibrator.

use super::{check_voltage, Calibrator};
use crate::error::{AppResult, CalError};
use crate::instrument::identity::Identity;
use crate::instrument::session::ScpiSession;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `ISR?` bit set once the output has settled.
const ISR_SETTLED: u32 = 0x1000;

/// Stop draining the fault queue after this many entries.
const MAX_FAULTS: usize = 32;

const MODELS: [&str; 3] = ["5700A", "5720A", "5730A"];

/// Resistance values the 5700A can source directly.
const RESISTANCE_VALUES: [f64; 18] = [
    0.0, 1.0, 1.9, 10.0, 19.0, 100.0, 190.0, 1e3, 1.9e3, 10e3, 19e3, 100e3, 190e3, 1e6, 1.9e6,
    10e6, 19e6, 100e6,
];

/// Current output terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlukeOutput {
    Normal,
    Aux,
    /// 5725A boost amplifier.
    Amplifier,
}

pub struct Fluke5700A {
    session: ScpiSession,
    identity: Identity,
    settle_polls: u32,
    boost: bool,
}

impl Fluke5700A {
    /// Identify the calibrator on `session`.
    pub async fn connect(mut session: ScpiSession) -> AppResult<Self> {
        let identity = session.identify().await?;
        info!(resource = %session.resource_name(), "Calibrator: {}", identity);
        Ok(Self {
            session,
            identity,
            settle_polls: 15,
            boost: false,
        })
    }

    /// Number of one-second `ISR?` polls before giving up on settling.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    pub fn boost(&self) -> bool {
        self.boost
    }

    /// Wait for the settled bit in `ISR?`, then clear any queued faults.
    ///
    /// Timeouts while polling count as a poll; settling can take long enough
    /// that queries get interrupted.
    pub async fn settle(&mut self) -> AppResult<()> {
        self.session.write("*OPC").await?;
        let mut polls = 0;
        while polls < self.settle_polls {
            match self.session.query("ISR?").await {
                Ok(status) => {
                    let bits = status.trim().parse::<u32>().unwrap_or(0);
                    if bits & ISR_SETTLED != 0 {
                        debug!(polls, "5700A settled");
                        break;
                    }
                    self.session.pause(Duration::from_secs(1)).await;
                    polls += 1;
                }
                Err(e) if e.is_retryable() => polls += 1,
                Err(e) => return Err(e),
            }
        }
        if polls >= self.settle_polls {
            warn!("5700A did not report settled after {} polls", polls);
        }
        self.drain_faults().await;
        Ok(())
    }

    /// Read and log every entry in the fault queue.
    pub async fn drain_faults(&mut self) -> Vec<String> {
        let mut faults = Vec::new();
        while faults.len() < MAX_FAULTS {
            let code = match self.session.query("FAULT?").await {
                Ok(reply) => reply.trim().parse::<i64>().unwrap_or(0),
                Err(e) => {
                    warn!("Exception during 5700A fault request: {}", e);
                    self.session.pause(Duration::from_secs(3)).await;
                    break;
                }
            };
            if code == 0 {
                break;
            }
            let explanation = self
                .session
                .query(&format!("EXPLAIN? {}", code))
                .await
                .unwrap_or_default();
            warn!("5700A fault {}; {}", code, explanation.trim());
            faults.push(format!("{}; {}", code, explanation.trim()));
        }
        faults
    }

    pub async fn set_ext_sense(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("EXTSENSE {}", state)).await
    }

    /// Source one of the fixed resistance values.
    pub async fn set_resistance(&mut self, ohms: f64) -> AppResult<()> {
        if !RESISTANCE_VALUES.iter().any(|r| (r - ohms).abs() < 1e-9) {
            return Err(CalError::InvalidArgument(format!(
                "5700A cannot source {} Ohm, only decades and 1.9 multiples",
                ohms
            )));
        }
        self.boost = false;
        self.session.write(&format!("OUT {} OHM", ohms)).await?;
        self.session.pause(Duration::from_secs(1)).await;
        Ok(())
    }

    /// 2-wire resistance with lead compensation up to 19 kOhm.
    pub async fn set_2w_resistance(&mut self, ohms: f64) -> AppResult<()> {
        // Compensation must be off first or a large value errors.
        self.session.write("RCOMP OFF").await?;
        self.set_resistance(ohms).await?;
        if ohms <= 19e3 {
            self.session.write("RCOMP ON").await
        } else {
            self.session.write("RCOMP OFF").await
        }
    }

    pub async fn set_4w_resistance(&mut self, ohms: f64) -> AppResult<()> {
        self.session.write("RCOMP OFF").await?;
        self.set_resistance(ohms).await?;
        self.set_ext_sense(true).await
    }

    /// Resistance the calibrator reports for its current output.
    pub async fn get_resistance(&mut self) -> AppResult<f64> {
        let mut last = None;
        for _ in 0..3 {
            match self.session.query("OUT?").await {
                Ok(reply) => {
                    if let Some(Ok(value)) = reply.split(',').next().map(|f| f.trim().parse()) {
                        return Ok(value);
                    }
                    last = Some(CalError::InvalidResponse {
                        command: "OUT?".into(),
                        response: reply,
                    });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| CalError::transport(self.session.resource_name(), "OUT? failed")))
    }

    pub async fn set_current_output(&mut self, output: FlukeOutput) -> AppResult<()> {
        if output == FlukeOutput::Amplifier {
            self.session.write("CUR_POST IB5725;BOOST ON").await?;
            self.boost = true;
        } else {
            self.session.write("CUR_POST NORMAL;BOOST OFF").await?;
            self.boost = false;
        }
        Ok(())
    }

    /// DC current, through the boost amplifier above 1 A.
    pub async fn set_current_dc(&mut self, amps: f64, boost: bool) -> AppResult<()> {
        check_current(amps)?;
        self.session.write("OUT 0 A, 0 Hz").await?;
        let output = if amps.abs() > 1.0 || boost {
            FlukeOutput::Amplifier
        } else {
            FlukeOutput::Normal
        };
        self.set_current_output(output).await?;
        self.session.write(&format!("OUT {} A, 0 Hz", amps)).await
    }

    /// AC current, through the boost amplifier above 1.99 A.
    pub async fn set_current_ac(&mut self, amps: f64, frequency: f64, boost: bool) -> AppResult<()> {
        check_current(amps)?;
        self.session.write("OUT 0 A, 0 Hz").await?;
        let output = if amps > 1.99 || boost {
            FlukeOutput::Amplifier
        } else {
            FlukeOutput::Normal
        };
        self.set_current_output(output).await?;
        self.session
            .write(&format!("OUT {} A, {} Hz", amps, frequency))
            .await
    }

    pub async fn set_phase_lock(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("PHASELCK {}", state)).await
    }
}

fn check_current(amps: f64) -> AppResult<()> {
    if amps.abs() > 10.0 {
        return Err(CalError::InvalidArgument(format!(
            "{} A is outside the 5700A current range",
            amps
        )));
    }
    Ok(())
}

#[async_trait]
impl Calibrator for Fluke5700A {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn is_expected_model(&self) -> bool {
        self.session.is_simulating() || self.identity.model_matches(&MODELS)
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.session.write("*RST;*CLS;*WAI").await?;
        self.session.pause(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn operate(&mut self) -> AppResult<()> {
        self.session.write("OPER").await?;
        self.settle().await
    }

    async fn standby(&mut self) -> AppResult<()> {
        self.session.write("STBY").await?;
        self.session.write("*OPC").await
    }

    async fn set_voltage_dc(&mut self, volts: f64) -> AppResult<()> {
        check_voltage(volts)?;
        self.boost = false;
        // 0 Hz clears any previous AC frequency.
        self.session.write(&format!("OUT {} V, 0 Hz", volts)).await
    }

    async fn set_voltage_ac(&mut self, volts: f64, frequency: f64) -> AppResult<()> {
        check_voltage(volts)?;
        self.boost = false;
        self.session
            .write(&format!("OUT {} V, {} Hz", volts, frequency))
            .await
    }

    async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}
