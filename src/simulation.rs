//! Simulated bench
//!
//! [`SimulatedBench`] hands out one [`SimulatedTransport`] per instrument.
//! The transports share a small model of the bench so simulated runs produce
//! plausible workbooks:
//! - the calibrator output appears on every scope input while operating
//! - the 33250A pulse train drives the scope markers and period readings,
//!   with the UUT timebase running slightly fast
//! - the RF generator output is what the trigger check sees
//! - the 3458A reads back the scope input impedance or the calibrator output
//!
//! Readings carry a little random noise.

use crate::adapters::SimulatedTransport;
use crate::instrument::calibrator::is_m142;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};

/// `*IDN?` of the simulated UUT unless another is given.
pub const DEFAULT_UUT_IDN: &str = "KEYSIGHT TECHNOLOGIES,DSO-X 3034T,MY58490123,07.50";

/// Fractional timebase error of the simulated UUT (20 ppm).
const TIMEBASE_ERROR: f64 = 2.0e-5;

/// 10-90 % rise time of the simulated UUT.
const RISE_TIME: f64 = 1.2e-9;

/// RMS noise floor of the simulated UUT.
const NOISE_FLOOR: f64 = 1.5e-4;

#[derive(Debug)]
struct BenchState {
    source_volts: f64,
    source_on: bool,
    pulse_period: f64,
    pulse_on: bool,
    rf_on: bool,
    input_fifty: bool,
    marker_x: f64,
    timebase: f64,
    measurement: String,
    dmm_function: String,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            source_volts: 0.0,
            source_on: false,
            pulse_period: 1e-3,
            pulse_on: false,
            rf_on: false,
            input_fifty: false,
            marker_x: 0.0,
            timebase: 1e-6,
            measurement: "MEAN".to_string(),
            dmm_function: "DCV".to_string(),
        }
    }
}

impl BenchState {
    fn applied(&self) -> f64 {
        if self.source_on {
            self.source_volts
        } else {
            0.0
        }
    }

    /// Level of the 0 to 1 V pulse train at `time`, as the UUT sees it.
    fn pulse_level(&self, time: f64) -> f64 {
        let period = self.pulse_period * (1.0 - TIMEBASE_ERROR);
        let edge = (time / period).round() * period;
        (0.5 + (time - edge) / (RISE_TIME * 1.25)).clamp(0.0, 1.0)
    }

    fn marker_level(&self) -> f64 {
        if self.pulse_on {
            self.pulse_level(self.marker_x)
        } else {
            self.applied()
        }
    }

    fn measurement(&self) -> f64 {
        match self.measurement.as_str() {
            "RISE" | "RISETIME" | "RTIM" => jitter(RISE_TIME, 1e-10),
            "RMS" => jitter(NOISE_FLOOR, 2e-5),
            "PER" | "PERIOD" => self.period(),
            _ => jitter(self.applied(), 1e-4),
        }
    }

    fn period(&self) -> f64 {
        jitter(self.pulse_period * (1.0 - TIMEBASE_ERROR), 1e-12)
    }

    fn triggered(&self) -> bool {
        self.rf_on || self.pulse_on
    }
}

fn jitter(value: f64, spread: f64) -> f64 {
    value + spread * (rand::thread_rng().gen::<f64>() - 0.5)
}

fn number(value: f64) -> Option<String> {
    Some(format!("{:E}", value))
}

/// First numeric argument after `prefix`, ignoring a trailing unit.
fn argument(command: &str, prefix: &str) -> Option<f64> {
    command
        .strip_prefix(prefix)?
        .split(|c: char| c.is_whitespace() || c == ',')
        .find(|token| !token.is_empty())?
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

/// Shared model behind a set of simulated instruments.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(state: &Mutex<BenchState>) -> MutexGuard<'_, BenchState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fluke 5700A family, or the Meatest M-142 when `model` names it.
    pub fn calibrator(&self, resource: &str, model: &str) -> SimulatedTransport {
        let state = self.state.clone();
        let idn = if is_m142(model) {
            "MEATEST,M-142,570123,2.05".to_string()
        } else {
            format!("FLUKE,{},7135001,D.01", model.to_ascii_uppercase())
        };
        SimulatedTransport::new(resource).with_responder(move |cmd| {
            let mut bench = Self::state(&state);
            for part in cmd.split(';').map(str::trim) {
                match part {
                    "OPER" | "OUTP ON" => bench.source_on = true,
                    "STBY" | "OUTP OFF" | "*RST" => bench.source_on = false,
                    _ => {}
                }
                if part.starts_with("OUT ") && part.contains(" V") {
                    if let Some(volts) = argument(part, "OUT ") {
                        bench.source_volts = volts;
                    }
                } else if let Some(volts) = argument(part, "VOLT ") {
                    bench.source_volts = volts;
                }
            }
            match cmd {
                "*IDN?" => Some(idn.clone()),
                "ISR?" => Some("4096".to_string()),
                "FAULT?" => Some("0".to_string()),
                "*OPC?" => Some("1".to_string()),
                "OUT?" => Some(format!("{:E},V,0", bench.source_volts)),
                _ if cmd.starts_with("EXPLAIN?") => Some("No fault".to_string()),
                _ => Some("0".to_string()),
            }
        })
    }

    /// Keysight 33250A.
    pub fn function_generator(&self, resource: &str) -> SimulatedTransport {
        let state = self.state.clone();
        SimulatedTransport::new(resource).with_responder(move |cmd| {
            let mut bench = Self::state(&state);
            for part in cmd.split(';').map(str::trim) {
                match part {
                    "OUTP ON" => bench.pulse_on = true,
                    "OUTP OFF" | "*RST" => bench.pulse_on = false,
                    _ => {}
                }
                if let Some(period) = argument(part, "PULS:PER ") {
                    bench.pulse_period = period;
                } else if let Some(freq) = argument(part, "FREQ ").filter(|f| *f > 0.0) {
                    bench.pulse_period = 1.0 / freq;
                }
            }
            match cmd {
                "*IDN?" => Some("Agilent Technologies,33250A,0,2.01-1.01-2.00-03-2".to_string()),
                _ => Some("0".to_string()),
            }
        })
    }

    /// Agilent E4438C.
    pub fn rf_generator(&self, resource: &str) -> SimulatedTransport {
        let state = self.state.clone();
        SimulatedTransport::new(resource).with_responder(move |cmd| {
            let mut bench = Self::state(&state);
            match cmd {
                "OUTP:STATE ON" => bench.rf_on = true,
                "OUTP:STATE OFF" | "*RST" => bench.rf_on = false,
                _ => {}
            }
            match cmd {
                "*IDN?" => Some("Agilent Technologies, E4438C, MY45093057, C.05.83".to_string()),
                _ => Some("0".to_string()),
            }
        })
    }

    /// Keysight 3458A. Triggered readings answer the last command written.
    pub fn dmm(&self, resource: &str) -> SimulatedTransport {
        let state = self.state.clone();
        SimulatedTransport::new(resource).with_responder(move |cmd| {
            let mut bench = Self::state(&state);
            if matches!(cmd, "DCV" | "ACV" | "OHM" | "OHMF" | "DCI" | "ACI") {
                bench.dmm_function = cmd.to_string();
            }
            match cmd {
                "ID?" => Some("HP3458A".to_string()),
                "ISCALE?" => number(1e-6),
                "TARM SGL" => {
                    let reading = match bench.dmm_function.as_str() {
                        "OHM" | "OHMF" if bench.input_fifty => jitter(50.0, 0.05),
                        "OHM" | "OHMF" => jitter(1.0e6, 500.0),
                        "DCV" => jitter(bench.applied(), 1e-6),
                        _ => jitter(1.0, 0.1),
                    };
                    number(reading)
                }
                _ => Some("0".to_string()),
            }
        })
    }

    /// Oscilloscope under test answering in the dialect of `idn`'s vendor.
    pub fn uut(&self, resource: &str, idn: &str) -> SimulatedTransport {
        let state = self.state.clone();
        let idn = idn.to_string();
        SimulatedTransport::new(resource).with_responder(move |cmd| {
            let mut bench = Self::state(&state);
            if cmd == "*RST" {
                bench.marker_x = 0.0;
                bench.timebase = 1e-6;
                bench.input_fifty = false;
            }
            if cmd.contains(":IMP ") || cmd.contains(":TER ") {
                bench.input_fifty = cmd.ends_with("FIFTY") || cmd.ends_with(" 50");
            }
            if let Some(scale) = argument(cmd, "TIM:SCAL ")
                .or_else(|| argument(cmd, "TIM:SCALE "))
                .or_else(|| argument(cmd, "HOR:SCAL "))
            {
                bench.timebase = scale;
            }
            if let Some(x) = argument(cmd, "MARK:X1P ") {
                bench.marker_x = x;
            }
            if let Some(kind) = cmd
                .strip_prefix("MEASU:MEAS1:TYPE ")
                .or_else(|| cmd.strip_prefix("MEAS1:TYPE "))
            {
                bench.measurement = kind.trim().to_string();
            }

            let triggered = bench.triggered();
            match cmd {
                "*IDN?" => Some(idn.clone()),
                "*OPC?" => Some("1".to_string()),
                "TER?" => Some((if triggered { "+1" } else { "+0" }).to_string()),
                "TRIG:STATE?" => Some((if triggered { "TRIG" } else { "READY" }).to_string()),
                "MEAS:VAV?" => number(jitter(bench.applied(), 1e-4)),
                "MEASU:MEAS1:VAL?" | "MEAS1:RESULT:ACTUAL?" => number(bench.measurement()),
                "MARK:X1P?" => number(bench.marker_x),
                "MARK:Y1P?" | "CURS:MEAS1:RESULT:ACTUAL?" => number(jitter(bench.marker_level(), 2e-5)),
                "MARK:YDEL?" | "CURS:DELTA?" => number(jitter(bench.applied(), 1e-4)),
                "TIM:SCAL?" | "HOR:SCAL?" => number(bench.timebase),
                _ if cmd.starts_with("MEAS:RIS?") => number(jitter(RISE_TIME, 1e-10)),
                _ if cmd.starts_with("MEAS:VRMS?") => number(jitter(NOISE_FLOOR, 2e-5)),
                _ if cmd.starts_with("MEAS:PER?") => number(bench.period()),
                _ => Some("0".to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transport;

    #[test]
    fn test_argument_strips_units() {
        assert_eq!(argument("OUT 0.02 V, 0 Hz", "OUT "), Some(0.02));
        assert_eq!(argument("VOLT 0V", "VOLT "), Some(0.0));
        assert_eq!(argument("PULS:PER 0.001", "PULS:PER "), Some(0.001));
        assert_eq!(argument("FUNC PULS", "PULS:PER "), None);
    }

    #[tokio::test]
    async fn test_calibrator_output_reaches_uut() {
        let bench = SimulatedBench::new();
        let mut cal = bench.calibrator("GPIB0::4::INSTR", "5730A");
        let mut uut = bench.uut("USB0::SIM", DEFAULT_UUT_IDN);

        cal.write("OUT 1.5 V, 0 Hz").await.unwrap();
        let off: f64 = uut.query("MEAS:VAV?").await.unwrap().parse().unwrap();
        assert!(off.abs() < 1e-3);

        cal.write("OPER").await.unwrap();
        let on: f64 = uut.query("MEAS:VAV?").await.unwrap().parse().unwrap();
        assert!((on - 1.5).abs() < 1e-3);

        cal.write("STBY").await.unwrap();
        let off: f64 = uut.query("MEAS:VAV?").await.unwrap().parse().unwrap();
        assert!(off.abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_m142_volt_command() {
        let bench = SimulatedBench::new();
        let mut cal = bench.calibrator("GPIB0::4::INSTR", "M142");
        let mut uut = bench.uut("USB0::SIM", DEFAULT_UUT_IDN);
        assert!(cal.query("*IDN?").await.unwrap().contains("M-142"));
        cal.write("FUNC DC;VOLT -2 V").await.unwrap();
        cal.write("OUTP ON").await.unwrap();
        let y: f64 = uut.query("MARK:Y1P?").await.unwrap().parse().unwrap();
        assert!((y + 2.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_pulse_edge_is_early_at_one_period() {
        let bench = SimulatedBench::new();
        let mut fgen = bench.function_generator("GPIB0::10::INSTR");
        let mut uut = bench.uut("USB0::SIM", DEFAULT_UUT_IDN);
        fgen.write("PULS:PER 0.001;PULS:WIDT 0.0002").await.unwrap();
        fgen.write("OUTP ON").await.unwrap();

        uut.write("MARK:X1P 0").await.unwrap();
        let at_trigger: f64 = uut.query("MARK:Y1P?").await.unwrap().parse().unwrap();
        assert!((at_trigger - 0.5).abs() < 1e-3);

        // The UUT sees the next edge 20 ns early, so one period later the
        // pulse is already high.
        uut.write("MARK:X1P 0.001").await.unwrap();
        let late: f64 = uut.query("MARK:Y1P?").await.unwrap().parse().unwrap();
        assert!(late > 0.99);
    }

    #[tokio::test]
    async fn test_trigger_follows_rf_output() {
        let bench = SimulatedBench::new();
        let mut rf = bench.rf_generator("GPIB0::19::INSTR");
        let mut tek = bench.uut("USB0::SIM", "TEKTRONIX,MSO58,C012345,CF:91.1CT FV:1.0");
        assert_eq!(tek.query("TRIG:STATE?").await.unwrap(), "READY");
        rf.write("OUTP:STATE ON").await.unwrap();
        assert_eq!(tek.query("TRIG:STATE?").await.unwrap(), "TRIG");
    }

    #[tokio::test]
    async fn test_dmm_reads_input_impedance() {
        let bench = SimulatedBench::new();
        let mut dmm = bench.dmm("GPIB0::22::INSTR");
        let mut uut = bench.uut("USB0::SIM", DEFAULT_UUT_IDN);
        uut.write("CHAN1:IMP FIFTY").await.unwrap();
        dmm.write("OHM").await.unwrap();
        dmm.write("TARM SGL").await.unwrap();
        let ohms: f64 = dmm.read().await.unwrap().parse().unwrap();
        assert!((ohms - 50.0).abs() < 0.1);

        uut.write("CHAN1:IMP ONEMEG").await.unwrap();
        let ohms: f64 = dmm.read().await.unwrap().parse().unwrap();
        assert!((ohms - 1.0e6).abs() < 1e3);
    }
}
