//! Keysight RF signal generators (E4438C, E8257D, N5183A) feeding the
//! trigger sensitivity tests.

use super::identity::Identity;
use super::session::ScpiSession;
use crate::error::AppResult;
use tracing::{debug, info};

const MODELS: [&str; 3] = ["E4438C", "E8257D", "N5183A"];

/// Power in dBm of a sine of `millivolts` RMS into 50 Ω.
pub fn mv_to_dbm(millivolts: f64) -> f64 {
    let watts = (millivolts / 1000.0).powi(2) / 50.0;
    10.0 * (watts / 1e-3).log10()
}

pub struct RfSignalGenerator {
    session: ScpiSession,
    identity: Identity,
}

impl RfSignalGenerator {
    pub async fn connect(mut session: ScpiSession) -> AppResult<Self> {
        let identity = session.identify().await?;
        info!(resource = %session.resource_name(), "RF generator: {}", identity);
        Ok(Self { session, identity })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_expected_model(&self) -> bool {
        self.session.is_simulating() || self.identity.model_matches(&MODELS)
    }

    pub async fn reset(&mut self) -> AppResult<()> {
        self.session.write("*RST").await
    }

    pub async fn set_frequency(&mut self, hz: f64) -> AppResult<()> {
        self.session.write(&format!("SOUR:FREQ {} Hz", hz)).await
    }

    pub async fn set_frequency_mhz(&mut self, mhz: f64) -> AppResult<()> {
        self.session.write(&format!("SOUR:FREQ {} MHz", mhz)).await
    }

    pub async fn set_level_dbm(&mut self, dbm: f64) -> AppResult<()> {
        self.session.write(&format!("POW {} dBm", dbm)).await
    }

    /// Output level as RMS millivolts into 50 Ω.
    pub async fn set_level_mv(&mut self, millivolts: f64) -> AppResult<()> {
        let dbm = (mv_to_dbm(millivolts) * 100.0).round() / 100.0;
        debug!(millivolts, dbm, "RF level");
        self.set_level_dbm(dbm).await
    }

    pub async fn set_output_state(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("OUTP:STATE {}", state)).await
    }

    pub async fn set_modulation_state(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("OUTP:MOD:STAT {}", state)).await
    }

    pub async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;

    #[test]
    fn test_millivolts_to_dbm() {
        // 223.6 mV RMS into 50 Ohm is 1 mW.
        assert!(mv_to_dbm(223.607).abs() < 1e-3);
        assert!((mv_to_dbm(22.3607) + 20.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_frequency_and_level() {
        let sim = SimulatedTransport::new("GPIB0::19::INSTR").with_responder(|cmd| {
            (cmd == "*IDN?").then(|| "Agilent Technologies,E4438C,MY45091234,C.05.83".into())
        });
        let mut gen = RfSignalGenerator::connect(ScpiSession::simulated(Box::new(sim.clone())))
            .await
            .unwrap();
        assert!(gen.is_expected_model());
        sim.clear_log();

        gen.set_frequency_mhz(100.0).await.unwrap();
        gen.set_level_dbm(-10.5).await.unwrap();
        gen.set_modulation_state(false).await.unwrap();
        gen.set_output_state(true).await.unwrap();
        assert_eq!(
            sim.written(),
            vec![
                "SOUR:FREQ 100 MHz",
                "POW -10.5 dBm",
                "OUTP:MOD:STAT OFF",
                "OUTP:STATE ON"
            ]
        );
    }
}
