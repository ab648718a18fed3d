//! Keysight 33250A function generator, used as the timebase reference and
//! the pulse source for period measurements.

use super::identity::Identity;
use super::session::ScpiSession;
use crate::error::{AppResult, CalError};
use tracing::info;

pub struct Ks33250A {
    session: ScpiSession,
    identity: Identity,
}

impl Ks33250A {
    pub async fn connect(mut session: ScpiSession) -> AppResult<Self> {
        let identity = session.identify().await?;
        info!(resource = %session.resource_name(), "Function generator: {}", identity);
        Ok(Self { session, identity })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_expected_model(&self) -> bool {
        self.session.is_simulating() || self.identity.model_matches(&["33250A"])
    }

    /// Sine wave, amplitude in V RMS.
    pub async fn set_sin(&mut self, frequency: f64, vrms: f64) -> AppResult<()> {
        self.session
            .write(&format!(
                "FUNC SIN;FREQ {};VOLT:UNIT VRMS; VOLTAGE {}",
                frequency, vrms
            ))
            .await
    }

    /// Square wave, amplitude in V peak-peak.
    pub async fn set_square(&mut self, frequency: f64, amplitude: f64) -> AppResult<()> {
        self.session
            .write(&format!(
                "FUNC SQU;FREQ {};VOLT:UNIT VPP;VOLTAGE {}",
                frequency, amplitude
            ))
            .await
    }

    /// Unipolar pulse train from 0 V to `amplitude`.
    pub async fn set_pulse(&mut self, period: f64, width: f64, amplitude: f64) -> AppResult<()> {
        if width <= 0.0 || width >= period {
            return Err(CalError::InvalidArgument(format!(
                "Pulse width {} s must be within the {} s period",
                width, period
            )));
        }
        self.session.write("FUNC PULS").await?;
        self.session
            .write(&format!("PULS:PER {};PULS:WIDT {}", period, width))
            .await?;
        self.session
            .write(&format!(
                "VOLT:UNIT VPP;VOLT {};VOLT:OFFS {}",
                amplitude,
                amplitude / 2.0
            ))
            .await
    }

    pub async fn enable_output(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("OUTP {}", state)).await
    }

    pub async fn reset(&mut self) -> AppResult<()> {
        self.session.write("*RST;*CLS").await
    }

    pub async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}
