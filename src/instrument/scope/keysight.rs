//! Keysight / Agilent InfiniiVision driver (DSOX1000 to DSOX3000, DSO5000).

use super::{
    average_query, on_off, read_settled, walk_cursor, BandwidthLimit, Coupling, Cursor,
    CursorDialect, Impedance, Oscilloscope, TriggerSource, DEFAULT_CHANNELS,
};
use crate::error::{AppResult, CalError};
use crate::instrument::identity::Identity;
use crate::instrument::session::ScpiSession;
use async_trait::async_trait;
use std::time::Duration;

/// Logic inputs on MSO models, D0 to D15 in two pods of eight.
pub const DIGITAL_CHANNELS: u8 = 16;

/// Command set differences between InfiniiVision generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysightFamily {
    Dsox1000,
    Dsox2000,
    Dsox3000,
    Dso5000,
}

impl KeysightFamily {
    /// Family from the model string, e.g. `DSO-X 3034T`, `DSOX1202G`, `DSO5054A`.
    pub fn from_model(model: &str) -> Self {
        let series = model
            .split_whitespace()
            .nth(1)
            .and_then(|number| number.chars().next())
            .or_else(|| model.chars().find(|c| c.is_ascii_digit()));
        match series {
            Some('1') => Self::Dsox1000,
            Some('2') => Self::Dsox2000,
            Some('5') => Self::Dso5000,
            _ => Self::Dsox3000,
        }
    }
}

/// Marker values above this mean the marker is not on a waveform yet.
const MARKER_INVALID: f64 = 9e37;

const MARKERS: CursorDialect = CursorDialect {
    x_query: "MARK:X1P?",
    y_query: "MARK:Y1P?",
    scale_query: "TIM:SCAL?",
    set_x: marker_x1,
};

fn marker_x1(position: f64) -> String {
    format!("MARK:X1P {}", position)
}

pub struct KeysightScope {
    session: ScpiSession,
    identity: Identity,
    family: KeysightFamily,
    num_channels: u8,
}

impl KeysightScope {
    pub fn new(session: ScpiSession, identity: Identity) -> Self {
        let family = KeysightFamily::from_model(&identity.model);
        let num_channels = match identity.channel_count() {
            0 => DEFAULT_CHANNELS,
            n => n,
        };
        Self {
            session,
            identity,
            family,
            num_channels,
        }
    }

    pub fn family(&self) -> KeysightFamily {
        self.family
    }

    async fn write_opc(&mut self, command: &str) -> AppResult<()> {
        self.session.write(command).await?;
        self.session.write("*OPC").await
    }

    /// Show digital channel `chan`. There is no off command; a reset clears
    /// them.
    pub async fn set_digital_channel_on(&mut self, chan: u8) -> AppResult<()> {
        check_digital(chan)?;
        self.session.write(&format!("DIG{}:DISP ON", chan)).await
    }

    pub async fn set_all_digital_channels_on(&mut self) -> AppResult<()> {
        for chan in 0..DIGITAL_CHANNELS {
            self.session.write(&format!("DIG{}:DISP ON", chan)).await?;
        }
        Ok(())
    }

    /// Logic threshold of digital channel `chan`, in volts.
    pub async fn set_digital_threshold(&mut self, chan: u8, threshold: f64) -> AppResult<()> {
        check_digital(chan)?;
        self.session
            .write(&format!("DIG{}:THR {}", chan, threshold))
            .await
    }

    /// State of the eight lines in `pod`: `Some(true)` when all are high,
    /// `Some(false)` when all are low, `None` when they are mixed.
    pub async fn measure_digital_channels(&mut self, pod: u8) -> AppResult<Option<bool>> {
        if !(1..=2).contains(&pod) {
            return Err(CalError::InvalidArgument(format!(
                "Digital pod {} does not exist (1 or 2)",
                pod
            )));
        }
        let command = format!("DIG SBUS{}?", pod);
        let reply = self.session.query(&command).await?;
        let bits = reply
            .trim()
            .trim_start_matches('+')
            .parse::<u32>()
            .map_err(|_| CalError::InvalidResponse {
                command,
                response: reply.trim().to_string(),
            })?;
        Ok(match bits & 0xFF {
            0xFF => Some(true),
            0 => Some(false),
            _ => None,
        })
    }
}

fn check_digital(chan: u8) -> AppResult<()> {
    if chan >= DIGITAL_CHANNELS {
        return Err(CalError::InvalidArgument(format!(
            "Digital channel D{} does not exist",
            chan
        )));
    }
    Ok(())
}

#[async_trait]
impl Oscilloscope for KeysightScope {
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
        self.write_opc(&format!("CHAN{}:DISP {}", chan, on_off(enabled)))
            .await
    }

    async fn set_only_channel(&mut self, chan: u8) -> AppResult<()> {
        for channel in 1..=self.num_channels {
            self.session
                .write(&format!("CHAN{}:DISP {}", channel, on_off(channel == chan)))
                .await?;
        }
        self.session.write("*OPC").await
    }

    async fn set_channel_bw_limit(&mut self, chan: u8, limit: BandwidthLimit) -> AppResult<()> {
        // InfiniiVision only has the fixed 20 MHz limit.
        let state = on_off(limit != BandwidthLimit::Full);
        self.write_opc(&format!("CHAN{}:BWL {}", chan, state)).await
    }

    async fn set_channel_impedance(&mut self, chan: u8, impedance: Impedance) -> AppResult<()> {
        let imp = match impedance {
            Impedance::Fifty => "FIFTY",
            Impedance::OneMeg => "ONEMEG",
        };
        self.session.write(&format!("CHAN{}:IMP {}", chan, imp)).await
    }

    async fn set_channel_invert(&mut self, chan: u8, inverted: bool) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:INV {}", chan, on_off(inverted)))
            .await
    }

    async fn set_channel_coupling(&mut self, chan: u8, coupling: Coupling) -> AppResult<()> {
        self.session
            .write(&format!("CHAN{}:COUP {}", chan, coupling.as_scpi()))
            .await
    }

    async fn set_voltage_scale(&mut self, chan: u8, scale: f64, probe: u32) -> AppResult<()> {
        // Probe must be set before the scale or the scale is rescaled.
        self.session
            .write(&format!("CHAN{}:PROB {}", chan, probe))
            .await?;
        self.write_opc(&format!("CHAN{}:SCAL {}", chan, scale)).await
    }

    async fn set_voltage_offset(&mut self, chan: u8, offset: f64) -> AppResult<()> {
        self.write_opc(&format!("CHAN{}:OFFS {}", chan, offset)).await
    }

    async fn set_voltage_position(&mut self, chan: u8, position: f64) -> AppResult<()> {
        // Offset and position are the same thing on InfiniiVision.
        self.write_opc(&format!("CHAN{}:OFFS {}", chan, position))
            .await
    }

    async fn set_timebase(&mut self, timebase: f64) -> AppResult<()> {
        self.write_opc(&format!("TIM:SCAL {}", timebase)).await
    }

    async fn set_timebase_pos(&mut self, position: f64) -> AppResult<()> {
        self.write_opc(&format!("TIM:POS {}", position)).await
    }

    async fn set_acquisition(&mut self, averages: u32) -> AppResult<()> {
        if averages <= 1 {
            self.write_opc("ACQ:TYPE NORM").await
        } else {
            self.write_opc(&format!("ACQ:TYPE AVER; COUNT {}", averages))
                .await
        }
    }

    async fn set_trigger_type(&mut self, mode: &str) -> AppResult<()> {
        self.session.write(&format!("TRIG:MODE {}", mode)).await?;
        self.write_opc("TRIG:SWE AUTO").await
    }

    async fn set_trigger_level(&mut self, source: TriggerSource, level: f64) -> AppResult<()> {
        let source = match source {
            TriggerSource::Channel(chan) => format!("CHAN{}", chan),
            TriggerSource::External => "EXT".to_string(),
        };
        self.session
            .write(&format!("TRIG:EDGE:SOUR {}", source))
            .await?;
        self.write_opc(&format!("TRIG:EDGE:LEV {}", level)).await
    }

    async fn measure_voltage(&mut self, chan: u8) -> AppResult<f64> {
        self.session
            .write(&format!("MEAS:SOURCE CHAN{}", chan))
            .await?;
        self.session.pause(Duration::from_millis(200)).await;
        self.session.read_query("MEAS:VAV?").await
    }

    async fn measure_clear(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn measure_risetime(&mut self, chan: u8, readings: u32) -> AppResult<f64> {
        self.write_opc(&format!("MEAS:RIS CHAN{}", chan)).await?;
        self.session.pause(Duration::from_secs(1)).await;
        average_query(
            &mut self.session,
            &format!("MEAS:RIS? CHAN{}", chan),
            readings,
            Duration::from_millis(100),
        )
        .await
    }

    async fn measure_rms_noise(&mut self, chan: u8) -> AppResult<f64> {
        self.session
            .write(&format!("MEAS:SOURCE CHAN{}", chan))
            .await?;
        self.session.pause(Duration::from_secs(2)).await;
        self.session
            .read_query(&format!("MEAS:VRMS? DISP,AC,CHAN{}", chan))
            .await
    }

    async fn measure_period(&mut self, chan: u8) -> AppResult<f64> {
        self.session.pause(Duration::from_millis(500)).await;
        read_settled(
            &mut self.session,
            &format!("MEAS:PER? CHAN{}", chan),
            MARKER_INVALID,
            Duration::from_millis(500),
        )
        .await
    }

    async fn cursors_on(&mut self) -> AppResult<()> {
        self.write_opc("MARK:MODE WAV").await
    }

    async fn read_cursor(&mut self, cursor: Cursor) -> AppResult<f64> {
        if self.family != KeysightFamily::Dsox1000 {
            self.session
                .write(&format!("MARK:{}:DISP ON", cursor))
                .await?;
        }
        self.session.write("*OPC").await?;
        read_settled(
            &mut self.session,
            &format!("MARK:{}P?", cursor),
            MARKER_INVALID,
            Duration::from_millis(200),
        )
        .await
    }

    async fn read_cursor_avg(&mut self) -> AppResult<f64> {
        self.session.write("MARK:MODE WAV").await?;
        if self.family == KeysightFamily::Dsox3000 {
            self.session.write("MARK:Y1:DISP ON").await?;
            self.session.write("MARK:Y2:DISP ON").await?;
        }
        let first = self.session.read_query("MARK:Y1P?").await?;
        let second = self.session.read_query("MARK:Y1P?").await?;
        Ok((first + second) / 2.0)
    }

    async fn read_cursor_ydelta(&mut self) -> AppResult<f64> {
        self.session.read_query("MARK:YDEL?").await
    }

    async fn set_cursor_xy_source(&mut self, chan: u8, cursor: u8) -> AppResult<()> {
        self.session.write("MARK:MODE WAV").await?;
        self.write_opc(&format!("MARK:X{c}Y{c} CHAN{}", chan, c = cursor))
            .await
    }

    async fn set_cursor_position(&mut self, cursor: Cursor, position: f64) -> AppResult<()> {
        self.write_opc(&format!("MARK:{}P {}", cursor, position))
            .await
    }

    async fn adjust_cursor(&mut self, target: f64) -> AppResult<()> {
        walk_cursor(&mut self.session, &MARKERS, target).await?;
        Ok(())
    }

    async fn check_triggered(&mut self, sweep_time: Duration) -> AppResult<bool> {
        self.session.write("*CLS").await?;
        self.session.pause(sweep_time).await;
        let reply = self.session.query("TER?").await?;
        Ok(reply.trim().trim_start_matches('+') == "1")
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

    fn scope(model: &str, sim: &SimulatedTransport) -> KeysightScope {
        let identity = Identity::parse(&format!("KEYSIGHT TECHNOLOGIES,{},MY58490123,07.50", model));
        KeysightScope::new(ScpiSession::simulated(Box::new(sim.clone())), identity)
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(KeysightFamily::from_model("DSO-X 3034T"), KeysightFamily::Dsox3000);
        assert_eq!(KeysightFamily::from_model("DSO-X 1102G"), KeysightFamily::Dsox1000);
        assert_eq!(KeysightFamily::from_model("DSOX2024A"), KeysightFamily::Dsox2000);
        assert_eq!(KeysightFamily::from_model("DSO5054A"), KeysightFamily::Dso5000);
        assert_eq!(KeysightFamily::from_model("MSO-X 4104A"), KeysightFamily::Dsox3000);
    }

    #[test]
    fn test_channel_count_from_identity() {
        let sim = SimulatedTransport::new("SIM");
        assert_eq!(scope("DSOX1202G", &sim).num_channels(), 2);
        assert_eq!(scope("DSO-X 3034T", &sim).num_channels(), 4);
    }

    #[tokio::test]
    async fn test_only_channel_sequence() {
        let sim = SimulatedTransport::new("SIM");
        let mut dso = scope("DSOX1202G", &sim);
        dso.set_only_channel(2).await.unwrap();
        assert_eq!(
            sim.written(),
            vec!["CHAN1:DISP OFF", "CHAN2:DISP ON", "*OPC"]
        );
    }

    #[tokio::test]
    async fn test_scale_sets_probe_first() {
        let sim = SimulatedTransport::new("SIM");
        let mut dso = scope("DSOX3034T", &sim);
        dso.set_voltage_scale(1, 0.005, 1).await.unwrap();
        assert_eq!(sim.written(), vec!["CHAN1:PROB 1", "CHAN1:SCAL 0.005", "*OPC"]);
    }

    #[tokio::test]
    async fn test_averaging_and_normal_acquisition() {
        let sim = SimulatedTransport::new("SIM");
        let mut dso = scope("DSOX3034T", &sim);
        dso.set_acquisition(64).await.unwrap();
        dso.set_acquisition(1).await.unwrap();
        let written = sim.written();
        assert_eq!(written[0], "ACQ:TYPE AVER; COUNT 64");
        assert_eq!(written[2], "ACQ:TYPE NORM");
    }

    #[tokio::test]
    async fn test_external_trigger_source() {
        let sim = SimulatedTransport::new("SIM");
        let mut dso = scope("DSOX3034T", &sim);
        dso.set_trigger_level(TriggerSource::External, 0.0).await.unwrap();
        assert_eq!(sim.written()[0], "TRIG:EDGE:SOUR EXT");
        assert_eq!(sim.written()[1], "TRIG:EDGE:LEV 0");
    }

    #[tokio::test]
    async fn test_read_cursor_rereads_invalid_marker() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("2.5E-9".into()));
        sim.push_reply("9.9E+37");
        let mut dso = scope("DSOX3034T", &sim);
        let x1 = dso.read_cursor(Cursor::X1).await.unwrap();
        assert!((x1 - 2.5e-9).abs() < 1e-15);
        assert_eq!(sim.written()[0], "MARK:X1:DISP ON");
    }

    #[tokio::test]
    async fn test_dsox1000_skips_marker_display() {
        let sim = SimulatedTransport::new("SIM");
        let mut dso = scope("DSOX1204G", &sim);
        dso.read_cursor(Cursor::Y1).await.unwrap();
        assert_eq!(sim.written()[0], "*OPC");
    }

    #[tokio::test]
    async fn test_check_triggered() {
        let sim = SimulatedTransport::new("SIM").with_responder(|cmd| {
            (cmd == "TER?").then(|| "+1".to_string())
        });
        let mut dso = scope("DSOX3034T", &sim);
        assert!(dso.check_triggered(Duration::from_millis(100)).await.unwrap());
        sim.push_reply("+0");
        assert!(!dso.check_triggered(Duration::from_millis(100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_risetime_average() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("1E-9".into()));
        sim.push_reply("2E-9");
        let mut dso = scope("DSOX3034T", &sim);
        // Scripted reply is consumed by the first reading.
        let rise = dso.measure_risetime(1, 2).await.unwrap();
        assert!((rise - 1.5e-9).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_digital_channel_setup() {
        let sim = SimulatedTransport::new("SIM");
        let mut mso = scope("MSO-X 3034T", &sim);
        mso.set_digital_channel_on(3).await.unwrap();
        mso.set_digital_threshold(3, 1.4).await.unwrap();
        assert!(mso.set_digital_channel_on(16).await.is_err());
        assert_eq!(sim.written(), vec!["DIG3:DISP ON", "DIG3:THR 1.4"]);

        sim.clear_log();
        mso.set_all_digital_channels_on().await.unwrap();
        let written = sim.written();
        assert_eq!(written.len(), 16);
        assert_eq!(written[15], "DIG15:DISP ON");
    }

    #[tokio::test]
    async fn test_digital_pod_state() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("255".into()));
        let mut mso = scope("MSO-X 3034T", &sim);
        assert_eq!(mso.measure_digital_channels(1).await.unwrap(), Some(true));
        sim.push_reply("+0");
        assert_eq!(mso.measure_digital_channels(2).await.unwrap(), Some(false));
        sim.push_reply("17");
        assert_eq!(mso.measure_digital_channels(1).await.unwrap(), None);
        sim.push_reply("garbage");
        assert!(matches!(
            mso.measure_digital_channels(1).await,
            Err(CalError::InvalidResponse { .. })
        ));
        assert!(mso.measure_digital_channels(3).await.is_err());
    }
}
