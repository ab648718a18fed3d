//! Rohde & Schwarz RTH Scope Rider driver.
//!
//! The RTH has fixed 1 MΩ inputs and no movable waveform markers, so
//! impedance selection and cursor positioning are accepted and ignored.

use super::{
    average_query, on_off, BandwidthLimit, Coupling, Cursor, Impedance, Oscilloscope,
    TriggerSource, DEFAULT_CHANNELS,
};
use crate::error::AppResult;
use crate::instrument::identity::Identity;
use crate::instrument::session::ScpiSession;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// RTH keyword for a bandwidth limit.
pub fn rth_bandwidth(limit: BandwidthLimit) -> String {
    match limit {
        BandwidthLimit::Full => "FULL".to_string(),
        BandwidthLimit::Limited => "B20".to_string(),
        BandwidthLimit::Mhz(mhz) => format!("B{}", mhz),
        BandwidthLimit::Khz(khz) => match khz {
            500 => "B5HK",
            400 => "B4HK",
            200 => "B2HK",
            100 => "B1HK",
            50 => "B50K",
            40 => "B40K",
            20 => "B20K",
            10 => "B10K",
            5 => "B5K",
            4 => "B4K",
            2 => "B2K",
            1 => "B1K",
            other => {
                warn!("Invalid RTH bandwidth {} kHz, using full bandwidth", other);
                "FULL"
            }
        }
        .to_string(),
    }
}

pub struct RohdeSchwarzScope {
    session: ScpiSession,
    identity: Identity,
    num_channels: u8,
}

impl RohdeSchwarzScope {
    pub fn new(session: ScpiSession, identity: Identity) -> Self {
        let num_channels = match identity.channel_count() {
            0 => DEFAULT_CHANNELS,
            n => n,
        };
        Self {
            session,
            identity,
            num_channels,
        }
    }

    async fn start_measurement(&mut self, kind: &str, chan: u8) -> AppResult<()> {
        self.measure_clear().await?;
        self.session.write(&format!("MEAS1:SOURCE C{}", chan)).await?;
        self.session.write(&format!("MEAS1:TYPE {}", kind)).await?;
        self.session.write("MEAS1:ENABLE ON").await
    }
}

#[async_trait]
impl Oscilloscope for RohdeSchwarzScope {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn num_channels(&self) -> u8 {
        self.num_channels
    }

    fn is_simulating(&self) -> bool {
        self.session.is_simulating()
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.session.write("*CLS").await?;
        self.session.write("*RST").await?;
        self.session.write("*OPC").await
    }

    async fn set_channel(&mut self, chan: u8, enabled: bool) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:STATE {}", chan, on_off(enabled)))
            .await?;
        self.session.write("*OPC").await
    }

    async fn set_only_channel(&mut self, chan: u8) -> AppResult<()> {
        for channel in 1..=self.num_channels {
            self.session
                .write(&format!("CHAN{}:STATE {}", channel, on_off(channel == chan)))
                .await?;
        }
        self.session.write("*OPC").await
    }

    async fn set_channel_bw_limit(&mut self, chan: u8, limit: BandwidthLimit) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:BANDWIDTH {}", chan, rth_bandwidth(limit)))
            .await?;
        self.session.write("*OPC").await
    }

    async fn set_channel_impedance(&mut self, chan: u8, impedance: Impedance) -> AppResult<()> {
        debug!(chan, ?impedance, "RTH inputs are fixed 1 MOhm, impedance ignored");
        Ok(())
    }

    async fn set_channel_invert(&mut self, chan: u8, inverted: bool) -> AppResult<()> {
        let state = if inverted { "INVERTED" } else { "NORMAL" };
        self.session
            .write(&format!("CHAN{}:POL {}", chan, state))
            .await
    }

    async fn set_channel_coupling(&mut self, chan: u8, coupling: Coupling) -> AppResult<()> {
        // DCL or ACL only, there is no ground coupling.
        if coupling == Coupling::Gnd {
            return Ok(());
        }
        self.session
            .write(&format!("CHAN{}:COUP {}L", chan, coupling.as_scpi()))
            .await
    }

    async fn set_voltage_scale(&mut self, chan: u8, scale: f64, probe: u32) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:PROBE V1TO{}", chan, probe.max(1)))
            .await?;
        self.session
            .write(&format!("CHAN{}:SCALE {}", chan, scale))
            .await
    }

    async fn set_voltage_offset(&mut self, chan: u8, offset: f64) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:OFFS {}", chan, offset))
            .await
    }

    async fn set_voltage_position(&mut self, chan: u8, position: f64) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:POS {}", chan, position))
            .await
    }

    async fn set_timebase(&mut self, timebase: f64) -> AppResult<()> {
        self.session.write(&format!("TIM:SCALE {}", timebase)).await
    }

    async fn set_timebase_pos(&mut self, position: f64) -> AppResult<()> {
        self.session
            .write(&format!("TIM:HOR:POS {}", position))
            .await
    }

    async fn set_acquisition(&mut self, averages: u32) -> AppResult<()> {
        if averages <= 1 {
            return self.session.write("ACQ:MODE SAMP").await;
        }
        self.session.write("ACQ:MODE AVER").await?;
        self.session
            .write(&format!("ACQ:AVER:COUNT {}", averages))
            .await
    }

    async fn set_trigger_type(&mut self, _mode: &str) -> AppResult<()> {
        self.session.write("TRIG:TYPE EDGE").await?;
        self.session.write("TRIG:MODE AUTO").await
    }

    async fn set_trigger_level(&mut self, source: TriggerSource, level: f64) -> AppResult<()> {
        let (source, index) = match source {
            TriggerSource::Channel(chan) => (format!("C{}", chan), chan),
            TriggerSource::External => ("EXT".to_string(), 5),
        };
        self.session.write(&format!("TRIG:SOUR {}", source)).await?;
        self.session
            .write(&format!("TRIG:LEV{}:VAL {}", index, level))
            .await
    }

    async fn measure_voltage(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("MEAN", chan).await?;
        self.session.pause(Duration::from_secs(6)).await;
        self.session.read_query("MEAS1:RESULT:ACTUAL?").await
    }

    async fn measure_clear(&mut self) -> AppResult<()> {
        self.session.write("MEAS1:ENABLE OFF").await
    }

    async fn measure_risetime(&mut self, chan: u8, readings: u32) -> AppResult<f64> {
        self.start_measurement("RTIM", chan).await?;
        self.session.pause(Duration::from_secs(2)).await;
        average_query(
            &mut self.session,
            "MEAS1:RESULT:ACTUAL?",
            readings,
            Duration::from_millis(100),
        )
        .await
    }

    async fn measure_rms_noise(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("RMS", chan).await?;
        self.session.pause(Duration::from_secs(2)).await;
        self.session.read_query("MEAS1:RESULT:ACTUAL?").await
    }

    async fn measure_period(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("PER", chan).await?;
        self.session.pause(Duration::from_secs(2)).await;
        self.session.read_query("MEAS1:RESULT:ACTUAL?").await
    }

    async fn cursors_on(&mut self) -> AppResult<()> {
        self.session.write("CURS:STATE ON").await?;
        self.session.write("*OPC").await
    }

    async fn read_cursor(&mut self, _cursor: Cursor) -> AppResult<f64> {
        self.session.write("CURS:FUNC MEAS").await?;
        self.session.write("CURS:MEAS:TYPE MEAN").await?;
        self.session.write("CURS:STATE ON").await?;
        self.session.read_query("CURS:MEAS1:RESULT:ACTUAL?").await
    }

    async fn read_cursor_avg(&mut self) -> AppResult<f64> {
        self.read_cursor(Cursor::Y1).await
    }

    async fn read_cursor_ydelta(&mut self) -> AppResult<f64> {
        self.session.read_query("CURS:DELTA?").await
    }

    async fn set_cursor_xy_source(&mut self, chan: u8, _cursor: u8) -> AppResult<()> {
        self.session.write("CURS:FUNC TRACK").await?;
        self.session.write(&format!("CURS:SOURCE C{}", chan)).await
    }

    async fn set_cursor_position(&mut self, cursor: Cursor, _position: f64) -> AppResult<()> {
        debug!(%cursor, "RTH cursor positioning not supported");
        Ok(())
    }

    async fn adjust_cursor(&mut self, target: f64) -> AppResult<()> {
        warn!(target, "RTH cannot move cursors, timebase result will be unadjusted");
        Ok(())
    }

    async fn check_triggered(&mut self, sweep_time: Duration) -> AppResult<bool> {
        self.session.pause(sweep_time).await;
        let state = self.session.query("TRIG:STATE?").await?;
        Ok(matches!(state.trim(), "AUTO" | "TRIG"))
    }

    async fn go_to_local(&mut self) -> AppResult<()> {
        self.session.go_to_local().await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.session.close().await
    }
}
