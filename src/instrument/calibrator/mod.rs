//! DC reference sources used for the vertical tests.
//!
//! Two calibrators are supported: the Fluke 5700A family (5700A, 5720A,
//! 5730A) and the Meatest M-142. Both are driven through [`Calibrator`] so the
//! sequencer never needs to know which one is on the bench.

pub mod fluke5700a;
pub mod m142;

pub use fluke5700a::{Fluke5700A, FlukeOutput};
pub use m142::MeatestM142;

use super::identity::Identity;
use super::session::ScpiSession;
use crate::error::{AppResult, CalError};
use async_trait::async_trait;

/// Largest voltage either calibrator will source.
pub const MAX_VOLTAGE: f64 = 1000.0;

#[async_trait]
pub trait Calibrator: Send {
    fn identity(&self) -> &Identity;

    /// Whether the identified model is one this driver was written for.
    fn is_expected_model(&self) -> bool;

    async fn reset(&mut self) -> AppResult<()>;

    /// Switch the output on and wait for it to settle.
    async fn operate(&mut self) -> AppResult<()>;

    async fn standby(&mut self) -> AppResult<()>;

    async fn set_voltage_dc(&mut self, volts: f64) -> AppResult<()>;

    async fn set_voltage_ac(&mut self, volts: f64, frequency: f64) -> AppResult<()>;

    async fn go_to_local(&mut self) -> AppResult<()>;

    async fn close(&mut self) -> AppResult<()>;
}

/// Whether `model` names the Meatest M-142, spelt `M142` or `M-142`.
pub fn is_m142(model: &str) -> bool {
    model.replace('-', "").eq_ignore_ascii_case("M142")
}

/// Open the calibrator named by `model` (`5700A`, `5720A`, `5730A` or `M142`).
pub async fn open_calibrator(
    model: &str,
    session: ScpiSession,
    settle_polls: u32,
) -> AppResult<Box<dyn Calibrator>> {
    if is_m142(model) {
        return Ok(Box::new(MeatestM142::connect(session).await?));
    }
    if ["5700A", "5720A", "5730A"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(model))
    {
        let fluke = Fluke5700A::connect(session).await?.with_settle_polls(settle_polls);
        return Ok(Box::new(fluke));
    }
    Err(CalError::UnsupportedInstrument(format!(
        "calibrator model '{}'",
        model
    )))
}

pub(crate) fn check_voltage(volts: f64) -> AppResult<()> {
    if volts.abs() > MAX_VOLTAGE {
        return Err(CalError::InvalidArgument(format!(
            "{} V is outside the calibrator range of +/-{} V",
            volts, MAX_VOLTAGE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;

    fn session(idn: &'static str) -> ScpiSession {
        let sim = SimulatedTransport::new("GPIB0::4::INSTR")
            .with_responder(move |cmd| (cmd == "*IDN?").then(|| idn.to_string()));
        ScpiSession::simulated(Box::new(sim))
    }

    #[tokio::test]
    async fn test_open_fluke_by_model() {
        let cal = open_calibrator("5730A", session("FLUKE,5730A,1234567,1.0"), 15)
            .await
            .unwrap();
        assert!(cal.is_expected_model());
        assert_eq!(cal.identity().serial, "1234567");
    }

    #[tokio::test]
    async fn test_open_m142() {
        let cal = open_calibrator("m142", session("MEATEST,M-142,1001,2.1"), 15)
            .await
            .unwrap();
        assert!(cal.is_expected_model());
    }

    #[tokio::test]
    async fn test_open_m142_hyphenated() {
        let cal = open_calibrator("M-142", session("MEATEST,M-142,1001,2.1"), 15)
            .await
            .unwrap();
        assert!(cal.is_expected_model());
        assert!(is_m142("m-142"));
        assert!(!is_m142("M1-4"));
    }

    #[tokio::test]
    async fn test_wrong_model_on_bus_is_flagged() {
        let cal = open_calibrator("5700A", session("MEATEST,M-142,1001,2.1"), 15)
            .await
            .unwrap();
        assert!(!cal.is_expected_model());
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let err = open_calibrator("9100", session("FLUKE,9100,1,1"), 15)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CalError::UnsupportedInstrument(_)));
    }

    #[test]
    fn test_voltage_limit() {
        assert!(check_voltage(-1000.0).is_ok());
        assert!(check_voltage(1000.5).is_err());
    }
}
