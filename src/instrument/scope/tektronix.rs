//! Tektronix driver (TDS/DPO/MSO 2000-4000 and the MSO4/5/6 series).
//!
//! Only measurement slot 1 is used. Tek scopes cannot reset measurement
//! statistics, so every measurement turns the slot off and back on.

use super::{
    average_query, on_off, read_settled, walk_cursor, BandwidthLimit, Coupling, Cursor,
    CursorDialect, Impedance, Oscilloscope, TriggerSource, DEFAULT_CHANNELS,
};
use crate::error::{AppResult, CalError};
use crate::instrument::identity::{channel_count_from_model, Identity};
use crate::instrument::session::ScpiSession;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// MSO 4/5/6 series take numeric bandwidth and termination values.
const NUMERIC_BW_MODELS: [&str; 9] = [
    "MSO44", "MSO46", "MSO56", "MSO58", "MSO58B", "MSO64", "MSO66", "MSO68", "MSO68B",
];

/// Measurement values above this mean "no result yet".
const MEAS_INVALID: f64 = 9e30;

/// Points fetched by [`TektronixScope::get_waveform`].
const WAVEFORM_POINTS: usize = 1000;

const MARKERS: CursorDialect = CursorDialect {
    x_query: "MARK:X1P?",
    y_query: "MARK:Y1P?",
    scale_query: "HOR:SCAL?",
    set_x: marker_x1,
};

fn marker_x1(position: f64) -> String {
    format!("MARK:X1P {}", position)
}

/// Channel count from Tek model naming: `MSO54` has 4, `MSO5104B` has 4.
pub fn tek_channel_count(model: &str) -> u8 {
    let digit_at = |idx: usize| {
        model
            .chars()
            .nth(idx)
            .and_then(|c| c.to_digit(10))
            .map(|d| d as u8)
    };
    if model.starts_with("MSO") {
        let len = model.chars().count();
        let count = if len == 5 {
            digit_at(4)
        } else if model.ends_with('B') && len >= 2 {
            digit_at(len - 2)
        } else {
            None
        };
        return count.unwrap_or(DEFAULT_CHANNELS);
    }
    match channel_count_from_model(model) {
        0 => DEFAULT_CHANNELS,
        n => n,
    }
}

/// A fetched trace: seconds relative to the trigger, and volts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    pub time: Vec<f64>,
    pub volts: Vec<f64>,
}

pub struct TektronixScope {
    session: ScpiSession,
    identity: Identity,
    num_channels: u8,
}

impl TektronixScope {
    pub fn new(session: ScpiSession, identity: Identity) -> Self {
        let num_channels = tek_channel_count(&identity.model);
        Self {
            session,
            identity,
            num_channels,
        }
    }

    fn numeric_settings(&self) -> bool {
        NUMERIC_BW_MODELS.contains(&self.identity.model.as_str())
    }

    async fn start_measurement(&mut self, kind: &str, chan: u8) -> AppResult<()> {
        self.measure_clear().await?;
        self.session
            .write(&format!("MEASU:MEAS1:TYPE {}", kind))
            .await?;
        self.session
            .write(&format!("MEASU:MEAS1:SOURCE CH{}", chan))
            .await?;
        self.session.write("MEASU:MEAS1:STATE ON").await
    }

    /// Cap the statistics population of measurement slot `slot`.
    pub async fn limit_measurement_population(&mut self, slot: u8, population: u32) -> AppResult<()> {
        self.session
            .write(&format!("MEASU:MEAS{}:POPULATION:LIMIT:STATE ON", slot))
            .await?;
        self.session
            .write(&format!("MEASU:MEAS{}:POPULATION:LIMIT:VAL {}", slot, population))
            .await
    }

    /// Fetch the first 1000 points of channel `chan` as one byte per point.
    pub async fn get_waveform(&mut self, chan: u8) -> AppResult<Waveform> {
        for cmd in [
            format!("DATA:SOURCE CH{}", chan),
            "DATA:WIDTH 1".to_string(),
            "DATA:ENC RPB".to_string(),
            "DATA:START 1".to_string(),
            format!("DATA:STOP {}", WAVEFORM_POINTS),
        ] {
            self.session.write(&cmd).await?;
        }
        let ymult = self.session.read_query("WFMINPRE:YMULT?").await?;
        let yzero = self.session.read_query("WFMINPRE:YZERO?").await?;
        let yoff = self.session.read_query("WFMINPRE:YOFF?").await?;
        let xincr = self.session.read_query("WFMINPRE:XINCR?").await?;
        let xdelay = self.session.read_query("HOR:POS?").await?;

        self.session.write("CURVE?").await?;
        let raw = self.read_block().await?;
        let volts: Vec<f64> = raw
            .iter()
            .map(|&adc| (f64::from(adc) - yoff) * ymult + yzero)
            .collect();
        let span = xincr * volts.len() as f64;
        let time = (0..volts.len())
            .map(|i| i as f64 * xincr - (span / 2.0 - xdelay))
            .collect();
        Ok(Waveform { time, volts })
    }

    /// IEEE 488.2 definite-length block: `#`, digit count, length, data,
    /// then the terminator.
    async fn read_block(&mut self) -> AppResult<Vec<u8>> {
        let bad_header = |header: &[u8]| CalError::InvalidResponse {
            command: "CURVE?".into(),
            response: String::from_utf8_lossy(header).into_owned(),
        };
        let head = self.session.read_bytes(2).await?;
        let digits = match head.as_slice() {
            [b'#', d @ b'1'..=b'9'] => usize::from(d - b'0'),
            _ => return Err(bad_header(&head)),
        };
        let length = self.session.read_bytes(digits).await?;
        let length: usize = std::str::from_utf8(&length)
            .ok()
            .and_then(|l| l.parse().ok())
            .ok_or_else(|| bad_header(&length))?;
        let mut data = self.session.read_bytes(length + 1).await?;
        data.truncate(length);
        Ok(data)
    }
}

#[async_trait]
impl Oscilloscope for TektronixScope {
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
            .write(&format!("SEL:CH{} {}", chan, on_off(enabled)))
            .await?;
        self.session.write("*OPC").await
    }

    async fn set_only_channel(&mut self, chan: u8) -> AppResult<()> {
        for channel in 1..=self.num_channels {
            self.session
                .write(&format!("SEL:CH{} {}", channel, on_off(channel == chan)))
                .await?;
        }
        self.session.write("*OPC").await
    }

    async fn set_channel_bw_limit(&mut self, chan: u8, limit: BandwidthLimit) -> AppResult<()> {
        let state = if self.numeric_settings() {
            match limit {
                BandwidthLimit::Full => "FULL".to_string(),
                BandwidthLimit::Limited => "20000000".to_string(),
                BandwidthLimit::Mhz(mhz) => (u64::from(mhz) * 1_000_000).to_string(),
                BandwidthLimit::Khz(khz) => (u64::from(khz) * 1_000).to_string(),
            }
        } else {
            match limit {
                BandwidthLimit::Limited => "TWE",
                BandwidthLimit::Mhz(20) => "TWENTY",
                BandwidthLimit::Mhz(150) => "ONEFIFTY",
                _ => "FULL",
            }
            .to_string()
        };
        // Some models take BAN and some BAND, the full keyword works on all.
        self.session
            .write(&format!("CH{}:BANDWIDTH {}", chan, state))
            .await?;
        self.session.write("*OPC").await
    }

    async fn set_channel_impedance(&mut self, chan: u8, impedance: Impedance) -> AppResult<()> {
        if self.identity.model.starts_with("MSO") {
            self.session
                .write(&format!("CH{}:TER {}", chan, impedance.ohms()))
                .await
        } else {
            let imp = match impedance {
                Impedance::Fifty => "FIFTY",
                Impedance::OneMeg => "MEG",
            };
            self.session.write(&format!("CH{}:IMP {}", chan, imp)).await
        }
    }

    async fn set_channel_invert(&mut self, chan: u8, inverted: bool) -> AppResult<()> {
        self.session
            .write(&format!("CH{}:INV {}", chan, on_off(inverted)))
            .await
    }

    async fn set_channel_coupling(&mut self, chan: u8, coupling: Coupling) -> AppResult<()> {
        self.session
            .write(&format!("CH{}:COUP {}", chan, coupling.as_scpi()))
            .await
    }

    async fn set_voltage_scale(&mut self, chan: u8, scale: f64, probe: u32) -> AppResult<()> {
        if self.identity.model.starts_with("TDS") {
            self.session
                .write(&format!("CH{}:PROBE {}", chan, probe))
                .await?;
        } else {
            // Gain is the reciprocal of attenuation.
            let gain = 1.0 / f64::from(probe.max(1));
            self.session
                .write(&format!("CH{}:PROBE:GAIN {}", chan, gain))
                .await?;
        }
        self.session
            .write(&format!("CH{}:VOL {}", chan, scale))
            .await
    }

    async fn set_voltage_offset(&mut self, chan: u8, offset: f64) -> AppResult<()> {
        // Centre of the acquisition window, opposite sense to Keysight.
        self.session
            .write(&format!("CH{}:OFFS {}", chan, offset))
            .await
    }

    async fn set_voltage_position(&mut self, chan: u8, position: f64) -> AppResult<()> {
        self.session
            .write(&format!("CH{}:POS {}", chan, position))
            .await
    }

    async fn set_timebase(&mut self, timebase: f64) -> AppResult<()> {
        self.session.write(&format!("HOR:SCAL {}", timebase)).await
    }

    async fn set_timebase_pos(&mut self, position: f64) -> AppResult<()> {
        self.session
            .write(&format!("HOR:DEL:TIM {}", position))
            .await
    }

    async fn set_acquisition(&mut self, averages: u32) -> AppResult<()> {
        if averages <= 1 {
            return self.session.write("ACQ:MODE SAMPLE").await;
        }
        self.session.write("ACQ:MODE AVE").await?;
        self.session
            .write(&format!("ACQ:NUMAV {}", averages))
            .await
    }

    async fn set_trigger_type(&mut self, _mode: &str) -> AppResult<()> {
        // Edge is the power-on default; only force auto sweep.
        self.session.write("TRIG:SWE AUTO").await
    }

    async fn set_trigger_level(&mut self, source: TriggerSource, level: f64) -> AppResult<()> {
        let source = match source {
            TriggerSource::Channel(chan) => format!("CH{}", chan),
            TriggerSource::External => "AUX".to_string(),
        };
        self.session
            .write(&format!("TRIG:A:EDGE:SOUR {}", source))
            .await?;
        self.session.write(&format!("TRIG:A:LEV {}", level)).await
    }

    async fn measure_voltage(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("MEAN", chan).await?;
        self.session.pause(Duration::from_millis(1500)).await;
        read_settled(
            &mut self.session,
            "MEASU:MEAS1:VAL?",
            MEAS_INVALID,
            Duration::from_secs(1),
        )
        .await
    }

    async fn measure_clear(&mut self) -> AppResult<()> {
        self.session.write("MEASU:MEAS1:STATE OFF").await
    }

    async fn measure_risetime(&mut self, chan: u8, readings: u32) -> AppResult<f64> {
        let kind = if self.numeric_settings() {
            "RISETIME"
        } else {
            "RISE"
        };
        self.start_measurement(kind, chan).await?;
        self.session.pause(Duration::from_secs(2)).await;
        let first = self.session.read_query("MEASU:MEAS1:VAL?").await?;
        if first > MEAS_INVALID {
            // Some models take much longer to produce a first reading.
            self.session.pause(Duration::from_secs(2)).await;
        }
        average_query(
            &mut self.session,
            "MEASU:MEAS1:VAL?",
            readings,
            Duration::from_millis(200),
        )
        .await
    }

    async fn measure_rms_noise(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("RMS", chan).await?;
        self.session.pause(Duration::from_secs(2)).await;
        self.session.read_query("MEASU:MEAS1:VAL?").await
    }

    async fn measure_period(&mut self, chan: u8) -> AppResult<f64> {
        self.start_measurement("PERIOD", chan).await?;
        self.session.pause(Duration::from_millis(1500)).await;
        read_settled(
            &mut self.session,
            "MEASU:MEAS1:VAL?",
            MEAS_INVALID,
            Duration::from_secs(1),
        )
        .await
    }

    async fn cursors_on(&mut self) -> AppResult<()> {
        self.session.write("CURS:FUNC WAV").await?;
        self.session.write("*OPC").await
    }

    async fn read_cursor(&mut self, cursor: Cursor) -> AppResult<f64> {
        self.session.write("MARK:MODE WAV").await?;
        self.session
            .write(&format!("MARK:{}:DISP ON", cursor))
            .await?;
        self.session
            .read_query(&format!("MARK:{}P?", cursor))
            .await
    }

    async fn read_cursor_avg(&mut self) -> AppResult<f64> {
        self.session.write("MARK:MODE WAV").await?;
        let first = self.session.read_query("MARK:Y1P?").await?;
        let second = self.session.read_query("MARK:Y1P?").await?;
        Ok((first + second) / 2.0)
    }

    async fn read_cursor_ydelta(&mut self) -> AppResult<f64> {
        self.session.read_query("MARK:YDEL?").await
    }

    async fn set_cursor_xy_source(&mut self, chan: u8, cursor: u8) -> AppResult<()> {
        self.session.write("CURS:FUNC WAV").await?;
        self.session.write("CURS:MOD TRACK").await?;
        self.session
            .write(&format!("CURS:SOU{} CH{}", cursor, chan))
            .await
    }

    async fn set_cursor_position(&mut self, cursor: Cursor, position: f64) -> AppResult<()> {
        self.session
            .write(&format!("MARK:{}P {}", cursor, position))
            .await
    }

    async fn adjust_cursor(&mut self, target: f64) -> AppResult<()> {
        let steps = walk_cursor(&mut self.session, &MARKERS, target).await?;
        if steps == 100 {
            warn!(target, "Cursor never crossed the reference level");
        }
        Ok(())
    }

    async fn check_triggered(&mut self, sweep_time: Duration) -> AppResult<bool> {
        self.session.pause(sweep_time).await;
        let state = self.session.query("TRIG:STATE?").await?;
        Ok(matches!(state.trim(), "AUTO" | "TRIG" | "TRIGGER"))
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

    fn scope(model: &str, sim: &SimulatedTransport) -> TektronixScope {
        let identity = Identity::parse(&format!("TEKTRONIX,{},C012345,CF:91.1CT", model));
        TektronixScope::new(ScpiSession::simulated(Box::new(sim.clone())), identity)
    }

    #[test]
    fn test_tek_channel_count() {
        assert_eq!(tek_channel_count("MSO54"), 4);
        assert_eq!(tek_channel_count("MSO58"), 8);
        assert_eq!(tek_channel_count("MSO5104B"), 4);
        assert_eq!(tek_channel_count("TDS2022C"), 2);
        assert_eq!(tek_channel_count("MSO4104"), 4);
    }

    #[tokio::test]
    async fn test_legacy_bandwidth_keywords() {
        let sim = SimulatedTransport::new("SIM");
        let mut tek = scope("DPO2014", &sim);
        tek.set_channel_bw_limit(1, BandwidthLimit::Limited).await.unwrap();
        tek.set_channel_bw_limit(2, BandwidthLimit::Mhz(150)).await.unwrap();
        tek.set_channel_bw_limit(3, BandwidthLimit::Mhz(350)).await.unwrap();
        let written = sim.written();
        assert_eq!(written[0], "CH1:BANDWIDTH TWE");
        assert_eq!(written[2], "CH2:BANDWIDTH ONEFIFTY");
        assert_eq!(written[4], "CH3:BANDWIDTH FULL");
    }

    #[tokio::test]
    async fn test_numeric_bandwidth_for_mso5() {
        let sim = SimulatedTransport::new("SIM");
        let mut tek = scope("MSO58", &sim);
        tek.set_channel_bw_limit(1, BandwidthLimit::Mhz(250)).await.unwrap();
        assert_eq!(sim.written()[0], "CH1:BANDWIDTH 250000000");
    }

    #[tokio::test]
    async fn test_impedance_dialects() {
        let sim = SimulatedTransport::new("SIM");
        let mut mso = scope("MSO54", &sim);
        mso.set_channel_impedance(1, Impedance::Fifty).await.unwrap();
        let mut dpo = scope("DPO2014", &sim);
        dpo.set_channel_impedance(1, Impedance::OneMeg).await.unwrap();
        assert_eq!(sim.written(), vec!["CH1:TER 50", "CH1:IMP MEG"]);
    }

    #[tokio::test]
    async fn test_measure_voltage_rereads_invalid() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("0.998".into()));
        sim.push_reply("9.91E37");
        let mut tek = scope("DPO2014", &sim);
        let volts = tek.measure_voltage(2).await.unwrap();
        assert!((volts - 0.998).abs() < 1e-9);
        let written = sim.written();
        assert_eq!(written[0], "MEASU:MEAS1:STATE OFF");
        assert_eq!(written[1], "MEASU:MEAS1:TYPE MEAN");
        assert_eq!(written[2], "MEASU:MEAS1:SOURCE CH2");
    }

    #[tokio::test]
    async fn test_trigger_state() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("READY".into()));
        let mut tek = scope("DPO2014", &sim);
        assert!(!tek.check_triggered(Duration::ZERO).await.unwrap());
        sim.push_reply("TRIGGER");
        assert!(tek.check_triggered(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_sample_mode_for_single_acquisition() {
        let sim = SimulatedTransport::new("SIM");
        let mut tek = scope("DPO2014", &sim);
        tek.set_acquisition(1).await.unwrap();
        tek.set_acquisition(16).await.unwrap();
        assert_eq!(
            sim.written(),
            vec!["ACQ:MODE SAMPLE", "ACQ:MODE AVE", "ACQ:NUMAV 16"]
        );
    }

    #[tokio::test]
    async fn test_measurement_population_limit() {
        let sim = SimulatedTransport::new("SIM");
        let mut tek = scope("MSO54", &sim);
        tek.limit_measurement_population(1, 50).await.unwrap();
        assert_eq!(
            sim.written(),
            vec![
                "MEASU:MEAS1:POPULATION:LIMIT:STATE ON",
                "MEASU:MEAS1:POPULATION:LIMIT:VAL 50"
            ]
        );
    }

    #[tokio::test]
    async fn test_waveform_scaled_from_curve_block() {
        let sim = SimulatedTransport::new("SIM").with_responder(|cmd| match cmd {
            "WFMINPRE:YMULT?" => Some("0.04".into()),
            "WFMINPRE:YZERO?" => Some("0".into()),
            "WFMINPRE:YOFF?" => Some("128".into()),
            "WFMINPRE:XINCR?" => Some("1E-6".into()),
            "HOR:POS?" => Some("0".into()),
            _ => None,
        });
        sim.push_bytes(b"#1".to_vec());
        sim.push_bytes(b"4".to_vec());
        sim.push_bytes(vec![128, 153, 103, 128, b'\n']);
        let mut tek = scope("MSO54", &sim);

        let wave = tek.get_waveform(2).await.unwrap();
        assert_eq!(sim.written()[0], "DATA:SOURCE CH2");
        assert_eq!(wave.volts.len(), 4);
        assert!(wave.volts[0].abs() < 1e-12);
        assert!((wave.volts[1] - 1.0).abs() < 1e-9);
        assert!((wave.volts[2] + 1.0).abs() < 1e-9);
        assert!((wave.time[0] + 2e-6).abs() < 1e-15);
        assert!((wave.time[3] - 1e-6).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_waveform_rejects_bad_block_header() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("1".into()));
        sim.push_bytes(b"XX".to_vec());
        let mut tek = scope("MSO54", &sim);
        assert!(matches!(
            tek.get_waveform(1).await,
            Err(CalError::InvalidResponse { .. })
        ));
    }
}
