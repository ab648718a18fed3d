//! Meatest M-142 multifunction calibrator.

use super::{check_voltage, Calibrator};
use crate::error::{AppResult, CalError};
use crate::instrument::identity::Identity;
use crate::instrument::session::ScpiSession;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// `*OPC?` attempts while settling, roughly 30 s at the default timeout.
const SETTLE_ATTEMPTS: u32 = 6;

pub struct MeatestM142 {
    session: ScpiSession,
    identity: Identity,
}

impl MeatestM142 {
    pub async fn connect(mut session: ScpiSession) -> AppResult<Self> {
        let identity = session.identify().await?;
        info!(resource = %session.resource_name(), "Calibrator: {}", identity);
        Ok(Self { session, identity })
    }

    pub async fn settle(&mut self) -> AppResult<()> {
        for attempt in 1..=SETTLE_ATTEMPTS {
            match self.session.query("*OPC?").await {
                Ok(_) => {
                    debug!(attempt, "M142 settled");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
        warn!("M142 did not complete after {} attempts", SETTLE_ATTEMPTS);
        Ok(())
    }

    pub async fn set_ext_sense(&mut self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.session.write(&format!("EXTSENSE {}", state)).await
    }

    pub async fn set_2w_resistance(&mut self, ohms: f64) -> AppResult<()> {
        self.session.write(&format!("RES {} OHM", ohms)).await
    }

    pub async fn get_resistance(&mut self) -> AppResult<f64> {
        self.session.read_query("RES?").await
    }

    pub async fn set_current_dc(&mut self, amps: f64) -> AppResult<()> {
        check_current(amps)?;
        self.session.write(&format!("FUNC DC;CURR {} A", amps)).await
    }

    pub async fn set_current_ac(&mut self, amps: f64, frequency: f64) -> AppResult<()> {
        check_current(amps)?;
        self.session
            .write(&format!("FUNC SIN;CURR {} A;FREQ {} Hz", amps, frequency))
            .await
    }

    /// Simulate a thermocouple of `tc_type` at `celsius`.
    pub async fn set_temperature(&mut self, celsius: f64, tc_type: &str) -> AppResult<()> {
        self.session.write("TEMP:UNITS C").await?;
        self.session
            .write(&format!("TEMP:THER:TYPE {}", tc_type))
            .await?;
        self.session.write(&format!("TEMP:THERM {}", celsius)).await
    }

    /// Power output in watts. A frequency selects AC; `phase` is in degrees,
    /// negative for lagging.
    pub async fn set_power(
        &mut self,
        watts: f64,
        volts: Option<f64>,
        frequency: Option<f64>,
        phase: Option<i32>,
    ) -> AppResult<()> {
        if watts > 4800.0 || volts.is_some_and(|v| v > 240.0) {
            return Err(CalError::InvalidArgument(format!(
                "M142 power {} W / {:?} V out of range",
                watts, volts
            )));
        }
        let mut freq_command = String::new();
        if let Some(freq) = frequency {
            self.session.write("FUNC SIN").await?;
            freq_command = format!("FREQ {} Hz", freq);
            // Power can only be set at zero phase.
            self.session.write("POWER:PHASE 0 LEAD").await?;
        } else {
            self.session.write("FUNC DC").await?;
        }
        if let Some(volts) = volts {
            self.session
                .write(&format!("POWER:VOLT {} V", volts))
                .await?;
        }
        self.session
            .write(&format!("POWER {} W; {}", watts, freq_command))
            .await?;
        if frequency.is_some() {
            let phase = phase.unwrap_or(0);
            let direction = if phase < 0 { "LAG" } else { "LEAD" };
            self.session
                .write(&format!("POWER:PHASE {} {}", phase, direction))
                .await?;
        }
        Ok(())
    }
}

fn check_current(amps: f64) -> AppResult<()> {
    if amps > 30.0 {
        return Err(CalError::InvalidArgument(format!(
            "{} A is outside the M142 current range",
            amps
        )));
    }
    Ok(())
}

#[async_trait]
impl Calibrator for MeatestM142 {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn is_expected_model(&self) -> bool {
        self.session.is_simulating() || self.identity.model_matches(&["M-142", "M142"])
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.session.write("*CLS;*RST").await?;
        self.session.write("FUNC DC;VOLT 0V").await?;
        // Switches the current coil off if it was in use.
        self.session.write("OUTP:ISEL HIGH").await
    }

    async fn operate(&mut self) -> AppResult<()> {
        self.session.write("OUTP ON").await?;
        self.settle().await
    }

    async fn standby(&mut self) -> AppResult<()> {
        self.session.write("OUTP OFF").await?;
        self.session.write("*OPC").await
    }

    async fn set_voltage_dc(&mut self, volts: f64) -> AppResult<()> {
        check_voltage(volts)?;
        self.session.write(&format!("FUNC DC;VOLT {} V", volts)).await
    }

    async fn set_voltage_ac(&mut self, volts: f64, frequency: f64) -> AppResult<()> {
        check_voltage(volts)?;
        self.session
            .write(&format!("FUNC SIN;VOLT {} V;FREQ {} Hz", volts, frequency))
            .await
    }

    async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;

    async fn m142(sim: &SimulatedTransport) -> MeatestM142 {
        let cal = MeatestM142::connect(ScpiSession::simulated(Box::new(sim.clone())))
            .await
            .unwrap();
        sim.clear_log();
        cal
    }

    fn sim() -> SimulatedTransport {
        SimulatedTransport::new("GPIB0::5::INSTR").with_responder(|cmd| match cmd {
            "*IDN?" => Some("MEATEST,M-142,1001,2.1".into()),
            _ => Some("1".into()),
        })
    }

    #[tokio::test]
    async fn test_reset_turns_off_coil() {
        let sim = sim();
        let mut cal = m142(&sim).await;
        cal.reset().await.unwrap();
        assert_eq!(
            sim.written(),
            vec!["*CLS;*RST", "FUNC DC;VOLT 0V", "OUTP:ISEL HIGH"]
        );
    }

    #[tokio::test]
    async fn test_operate_then_standby() {
        let sim = sim();
        let mut cal = m142(&sim).await;
        cal.set_voltage_dc(0.5).await.unwrap();
        cal.operate().await.unwrap();
        cal.standby().await.unwrap();
        assert_eq!(
            sim.written(),
            vec!["FUNC DC;VOLT 0.5 V", "OUTP ON", "*OPC?", "OUTP OFF", "*OPC"]
        );
    }

    #[tokio::test]
    async fn test_settle_tolerates_timeouts() {
        let sim = sim();
        let mut cal = m142(&sim).await;
        // Every retry of the first attempt fails, the second attempt succeeds.
        sim.inject_failures(3);
        cal.settle().await.unwrap();
        assert_eq!(sim.written(), vec!["*OPC?"]);
    }

    #[tokio::test]
    async fn test_ac_power_with_lagging_phase() {
        let sim = sim();
        let mut cal = m142(&sim).await;
        cal.set_power(150.0, None, Some(50.0), Some(-30)).await.unwrap();
        assert_eq!(
            sim.written(),
            vec![
                "FUNC SIN",
                "POWER:PHASE 0 LEAD",
                "POWER 150 W; FREQ 50 Hz",
                "POWER:PHASE -30 LAG"
            ]
        );
        assert!(cal.set_power(5000.0, None, None, None).await.is_err());
    }
}
