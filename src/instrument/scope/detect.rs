//! Pick the UUT driver from its identification string.

use super::{KeysightScope, Oscilloscope, RohdeSchwarzScope, TektronixScope};
use crate::error::{AppResult, CalError};
use crate::instrument::identity::Manufacturer;
use crate::adapters::Transport;
use crate::instrument::session::ScpiSession;
use tracing::info;

/// Identify the instrument behind `transport` and wrap it in the matching driver.
///
/// Fails with [`CalError::NotConnected`] when the UUT does not answer `*IDN?`
/// sensibly, and [`CalError::UnsupportedInstrument`] for vendors without a driver.
pub async fn load_uut_driver(
    transport: Box<dyn Transport>,
    simulating: bool,
) -> AppResult<Box<dyn Oscilloscope>> {
    let mut session = if simulating {
        ScpiSession::simulated(transport)
    } else {
        ScpiSession::new(transport)
    };
    let identity = session.identify().await?;
    if identity.is_empty() {
        return Err(CalError::NotConnected(session.resource_name().to_string()));
    }

    info!(
        resource = %session.resource_name(),
        "UUT identified as {}", identity
    );

    let driver: Box<dyn Oscilloscope> = match identity.manufacturer_kind() {
        Manufacturer::Keysight => Box::new(KeysightScope::new(session, identity)),
        Manufacturer::Tektronix => Box::new(TektronixScope::new(session, identity)),
        Manufacturer::RohdeSchwarz => Box::new(RohdeSchwarzScope::new(session, identity)),
        Manufacturer::Other => {
            return Err(CalError::UnsupportedInstrument(format!(
                "{} {}",
                identity.manufacturer, identity.model
            )))
        }
    };
    Ok(driver)
}
