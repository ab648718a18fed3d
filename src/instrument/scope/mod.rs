//! Oscilloscope (UUT) drivers.
//!
//! Every supported scope implements [`Oscilloscope`], the operation set the
//! calibration procedures need: channel setup, timebase and trigger control,
//! automatic measurements and waveform cursors. Vendors differ only in SCPI
//! dialect, so procedures are written once against the trait.
//!
//! Use [`detect::load_uut_driver`] to pick the driver from the UUT's `*IDN?`.

pub mod detect;
pub mod keysight;
pub mod rohde_schwarz;
pub mod tektronix;

pub use detect::load_uut_driver;
pub use keysight::{KeysightFamily, KeysightScope};
pub use rohde_schwarz::RohdeSchwarzScope;
pub use tektronix::TektronixScope;

use super::identity::{Identity, Manufacturer};
use super::session::ScpiSession;
use crate::error::{AppResult, CalError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Channel count assumed when the model number does not encode one.
pub const DEFAULT_CHANNELS: u8 = 4;

/// Vertical input coupling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coupling {
    #[default]
    Dc,
    Ac,
    Gnd,
}

impl Coupling {
    pub fn as_scpi(&self) -> &'static str {
        match self {
            Self::Dc => "DC",
            Self::Ac => "AC",
            Self::Gnd => "GND",
        }
    }
}

impl FromStr for Coupling {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "DC" | "DCL" => Ok(Self::Dc),
            "AC" | "ACL" => Ok(Self::Ac),
            "GND" => Ok(Self::Gnd),
            other => Err(CalError::InvalidArgument(format!("Unknown coupling '{}'", other))),
        }
    }
}

/// Channel input impedance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Impedance {
    Fifty,
    OneMeg,
}

impl Impedance {
    pub fn ohms(&self) -> u32 {
        match self {
            Self::Fifty => 50,
            Self::OneMeg => 1_000_000,
        }
    }
}

impl FromStr for Impedance {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_uppercase();
        match text.as_str() {
            "50" | "50R" | "50.0" | "FIFTY" => Ok(Self::Fifty),
            "1M" | "1M0" | "1MEG" | "1000000" | "1E6" | "ONEMEG" | "MEG" => Ok(Self::OneMeg),
            _ => Err(CalError::InvalidArgument(format!("Unknown impedance '{}'", s.trim()))),
        }
    }
}

/// Channel bandwidth limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthLimit {
    /// Full bandwidth
    #[default]
    Full,
    /// The scope's standard limit (20 MHz on most models)
    Limited,
    /// Limit to this many MHz
    Mhz(u32),
    /// Limit to this many kHz (handheld scopes)
    Khz(u32),
}

impl FromStr for BandwidthLimit {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_uppercase();
        match text.as_str() {
            "" | "0" | "OFF" | "FULL" | "N" | "NO" | "FALSE" => return Ok(Self::Full),
            "ON" | "Y" | "YES" | "TRUE" | "BWL" => return Ok(Self::Limited),
            _ => {}
        }
        let invalid = || CalError::InvalidArgument(format!("Unknown bandwidth limit '{}'", s.trim()));
        let digits = text.trim_end_matches("HZ");
        if let Some(khz) = digits.strip_suffix('K') {
            return khz.trim().parse().map(Self::Khz).map_err(|_| invalid());
        }
        let mhz = digits.strip_suffix('M').unwrap_or(digits);
        mhz.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v > 0.0)
            .map(|v| Self::Mhz(v.round() as u32))
            .ok_or_else(invalid)
    }
}

/// Waveform cursor (marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    X1,
    X2,
    Y1,
    Y2,
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X1 => "X1",
            Self::X2 => "X2",
            Self::Y1 => "Y1",
            Self::Y2 => "Y2",
        };
        f.write_str(name)
    }
}

/// Edge trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    External,
    Channel(u8),
}

/// Operations every UUT driver provides.
#[async_trait]
pub trait Oscilloscope: Send {
    /// Identification read when the driver was loaded.
    fn identity(&self) -> &Identity;

    fn manufacturer(&self) -> Manufacturer {
        self.identity().manufacturer_kind()
    }

    /// Number of analog input channels.
    fn num_channels(&self) -> u8;

    fn is_simulating(&self) -> bool;

    /// `*CLS`, `*RST` and wait for completion.
    async fn reset(&mut self) -> AppResult<()>;

    /// Turn one channel's display on or off.
    async fn set_channel(&mut self, chan: u8, enabled: bool) -> AppResult<()>;

    /// Display `chan` and turn every other channel off.
    async fn set_only_channel(&mut self, chan: u8) -> AppResult<()>;

    async fn set_channel_bw_limit(&mut self, chan: u8, limit: BandwidthLimit) -> AppResult<()>;

    async fn set_channel_impedance(&mut self, chan: u8, impedance: Impedance) -> AppResult<()>;

    async fn set_channel_invert(&mut self, chan: u8, inverted: bool) -> AppResult<()>;

    async fn set_channel_coupling(&mut self, chan: u8, coupling: Coupling) -> AppResult<()>;

    /// Vertical scale in V/div for a given probe attenuation.
    async fn set_voltage_scale(&mut self, chan: u8, scale: f64, probe: u32) -> AppResult<()>;

    /// Vertical offset in volts.
    async fn set_voltage_offset(&mut self, chan: u8, offset: f64) -> AppResult<()>;

    /// Vertical position in divisions (the offset on scopes without a separate position).
    async fn set_voltage_position(&mut self, chan: u8, position: f64) -> AppResult<()>;

    /// Horizontal scale in s/div.
    async fn set_timebase(&mut self, timebase: f64) -> AppResult<()>;

    /// Horizontal delay in seconds.
    async fn set_timebase_pos(&mut self, position: f64) -> AppResult<()>;

    /// Averaging count. `1` selects normal (sample) acquisition.
    async fn set_acquisition(&mut self, averages: u32) -> AppResult<()>;

    async fn set_trigger_type(&mut self, mode: &str) -> AppResult<()>;

    async fn set_trigger_level(&mut self, source: TriggerSource, level: f64) -> AppResult<()>;

    /// Mean voltage of the displayed waveform.
    async fn measure_voltage(&mut self, chan: u8) -> AppResult<f64>;

    async fn measure_clear(&mut self) -> AppResult<()>;

    /// Average of `readings` rise time measurements.
    async fn measure_risetime(&mut self, chan: u8, readings: u32) -> AppResult<f64>;

    /// AC RMS of the displayed waveform.
    async fn measure_rms_noise(&mut self, chan: u8) -> AppResult<f64>;

    /// Period of the displayed waveform.
    async fn measure_period(&mut self, chan: u8) -> AppResult<f64>;

    async fn cursors_on(&mut self) -> AppResult<()>;

    async fn read_cursor(&mut self, cursor: Cursor) -> AppResult<f64>;

    /// Average of two Y1 readings.
    async fn read_cursor_avg(&mut self) -> AppResult<f64>;

    async fn read_cursor_ydelta(&mut self) -> AppResult<f64>;

    /// Bind the X`n`Y`n` marker pair to a channel.
    async fn set_cursor_xy_source(&mut self, chan: u8, cursor: u8) -> AppResult<()>;

    async fn set_cursor_position(&mut self, cursor: Cursor, position: f64) -> AppResult<()>;

    /// Walk X1 along the waveform until Y1 crosses `target`.
    async fn adjust_cursor(&mut self, target: f64) -> AppResult<()>;

    /// Clear the trigger event, wait one sweep, and report whether it fired.
    async fn check_triggered(&mut self, sweep_time: Duration) -> AppResult<bool>;

    async fn go_to_local(&mut self) -> AppResult<()>;

    async fn close(&mut self) -> AppResult<()>;
}

/// Marker commands used by [`walk_cursor`].
pub(crate) struct CursorDialect {
    pub x_query: &'static str,
    pub y_query: &'static str,
    pub scale_query: &'static str,
    pub set_x: fn(f64) -> String,
}

/// Maximum X1 steps before giving up on a crossing.
const MAX_CURSOR_STEPS: usize = 100;

/// Ignore targets closer than this to the current Y1 (0.1 div at 0.5 V/div).
const CURSOR_DEADBAND: f64 = 0.05;

/// Step X1 by a twentieth of a division towards `target` until Y1 passes it.
///
/// Returns the number of steps taken.
pub(crate) async fn walk_cursor(
    session: &mut ScpiSession,
    dialect: &CursorDialect,
    target: f64,
) -> AppResult<usize> {
    let mut current_y = session.read_query(dialect.y_query).await?;
    let mut current_x = session.read_query(dialect.x_query).await?;
    let increment = session.read_query(dialect.scale_query).await? / 20.0;
    let direction = if current_y < target { 1.0 } else { -1.0 };

    if (current_y - target).abs() <= CURSOR_DEADBAND {
        return Ok(0);
    }

    for step in 1..=MAX_CURSOR_STEPS {
        session.write(&(dialect.set_x)(current_x + increment * direction)).await?;
        session.write("*OPC").await?;
        session.pause(Duration::from_millis(50)).await;
        current_x = session.read_query(dialect.x_query).await?;
        current_y = session.read_query(dialect.y_query).await?;
        // Steep edges can jump straight past the target.
        if direction * (current_y - target) > 0.0 {
            debug!(step, x = current_x, y = current_y, "cursor crossed target");
            return Ok(step);
        }
    }
    Ok(MAX_CURSOR_STEPS)
}

/// Average `readings` values of a numeric query, pausing between reads.
pub(crate) async fn average_query(
    session: &mut ScpiSession,
    query: &str,
    readings: u32,
    gap: Duration,
) -> AppResult<f64> {
    let count = readings.max(1);
    let mut total = 0.0;
    for _ in 0..count {
        total += session.read_query(query).await?;
        session.pause(gap).await;
    }
    Ok(total / f64::from(count))
}

/// Read a measurement, re-reading once after `wait` if the scope reports
/// "no result yet" (a value above `invalid_above`).
pub(crate) async fn read_settled(
    session: &mut ScpiSession,
    query: &str,
    invalid_above: f64,
    wait: Duration,
) -> AppResult<f64> {
    let value = session.read_query(query).await?;
    if value > invalid_above {
        session.pause(wait).await;
        return session.read_query(query).await;
    }
    Ok(value)
}

pub(crate) fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_coupling_parse() {
        assert_eq!("dc".parse::<Coupling>().unwrap(), Coupling::Dc);
        assert_eq!("".parse::<Coupling>().unwrap(), Coupling::Dc);
        assert_eq!("AC".parse::<Coupling>().unwrap(), Coupling::Ac);
        assert_eq!("GND".parse::<Coupling>().unwrap(), Coupling::Gnd);
        assert!("XY".parse::<Coupling>().is_err());
    }

    #[test]
    fn test_impedance_parse() {
        assert_eq!("50".parse::<Impedance>().unwrap(), Impedance::Fifty);
        assert_eq!("1M".parse::<Impedance>().unwrap(), Impedance::OneMeg);
        assert_eq!(Impedance::OneMeg.ohms(), 1_000_000);
        assert!("75".parse::<Impedance>().is_err());
    }

    #[test]
    fn test_bandwidth_parse() {
        assert_eq!("".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Full);
        assert_eq!("ON".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Limited);
        assert_eq!("20".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Mhz(20));
        assert_eq!("150M".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Mhz(150));
        assert_eq!("500k".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Khz(500));
        assert_eq!("20MHz".parse::<BandwidthLimit>().unwrap(), BandwidthLimit::Mhz(20));
        assert!("wide".parse::<BandwidthLimit>().is_err());
    }

    #[tokio::test]
    async fn test_walk_cursor_stops_after_crossing() {
        // Y1 rises by 0.1 V per step once X1 starts moving.
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();
        let sim = SimulatedTransport::new("SIM").with_responder(move |cmd| {
            let reply = match cmd {
                "TIM:SCAL?" => "1E-8".to_string(),
                "MARK:X1P?" => "0".to_string(),
                "MARK:Y1P?" => {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    format!("{}", 0.1 * f64::from(n))
                }
                _ => return None,
            };
            Some(reply)
        });
        let mut session = ScpiSession::simulated(Box::new(sim.clone()));
        let dialect = CursorDialect {
            x_query: "MARK:X1P?",
            y_query: "MARK:Y1P?",
            scale_query: "TIM:SCAL?",
            set_x: |x| format!("MARK:X1P {}", x),
        };
        let steps = walk_cursor(&mut session, &dialect, 0.45).await.unwrap();
        assert_eq!(steps, 5);
        let moves = sim
            .written()
            .iter()
            .filter(|c| c.starts_with("MARK:X1P "))
            .count();
        assert_eq!(moves, 5);
    }

    #[tokio::test]
    async fn test_walk_cursor_deadband() {
        let sim = SimulatedTransport::new("SIM").with_responder(|cmd| match cmd {
            "MARK:Y1P?" => Some("0.52".to_string()),
            _ => Some("0".to_string()),
        });
        let mut session = ScpiSession::simulated(Box::new(sim.clone()));
        let dialect = CursorDialect {
            x_query: "MARK:X1P?",
            y_query: "MARK:Y1P?",
            scale_query: "TIM:SCAL?",
            set_x: |x| format!("MARK:X1P {}", x),
        };
        assert_eq!(walk_cursor(&mut session, &dialect, 0.5).await.unwrap(), 0);
        assert!(!sim.written().iter().any(|c| c.starts_with("MARK:X1P ")));
    }
}
