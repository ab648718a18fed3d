//! Vertical tests: everything driven by the DC calibrator or measured with
//! the inputs open.

use super::{input_channel, skipped, tested, CalibrationRunner, CursorReading, Progress};
use crate::error::AppResult;
use crate::instrument::scope::{BandwidthLimit, Cursor, Impedance};
use crate::instrument::DmmFunction;
use crate::sequencer::RowStatus;
use crate::workbook::{to_display_units, DcvSettings, ResultsSheet, Sheet, TestKind};
use std::time::Duration;
use tracing::{debug, warn};

/// Calibrator output settling time before the scope is read.
const SOURCE_SETTLE: Duration = Duration::from_secs(1);

/// Averages used for DC readings.
const DC_AVERAGES: u32 = 64;

/// 3458A readings averaged per impedance row.
const OHMS_READINGS: u32 = 5;

/// Channel currently wired to the calibrator.
#[derive(Debug, Clone, Copy)]
struct WiredChannel {
    chan: u8,
    impedance_changed: bool,
}

impl CalibrationRunner {
    /// DC voltage accuracy. Also collects the cursor deltas for CURS.
    pub(super) async fn test_dcv<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        parallel: bool,
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.cursor_readings.clear();
        self.run_sourced(TestKind::Dcv, sheet, rows, parallel, progress)
            .await
    }

    /// Difference between the readings at +V and -V.
    pub(super) async fn test_dcv_balance<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        parallel: bool,
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.run_sourced(TestKind::DcvBalance, sheet, rows, parallel, progress)
            .await
    }

    /// Reading with the trace moved by the offset column, in divisions.
    pub(super) async fn test_position<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        parallel: bool,
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.run_sourced(TestKind::Position, sheet, rows, parallel, progress)
            .await
    }

    /// Rows that apply a calibrator voltage, one channel at a time.
    async fn run_sourced<S: Sheet>(
        &mut self,
        kind: TestKind,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        parallel: bool,
        progress: &mut Progress,
    ) -> AppResult<()> {
        let channels = self.instruments.uut.num_channels();
        self.instruments.uut.reset().await?;
        if parallel {
            self.operator
                .prompt("Connect calibrator output to all channels in parallel")
                .await?;
        }
        self.instruments.uut.set_only_channel(1).await?;
        self.instruments.uut.set_acquisition(DC_AVERAGES).await?;

        let mut wired = None;
        let mut outcome = Ok(());
        for &row in rows {
            let result = self
                .sourced_row(kind, sheet, row, parallel, channels, &mut wired)
                .await;
            let result = self.standby_on_error(result).await;
            if let Err(e) = self.record(progress, row, kind, result) {
                outcome = Err(e);
                break;
            }
        }
        let restored = self.restore_vertical(channels, wired).await;
        outcome.and(restored)
    }

    async fn sourced_row<S: Sheet>(
        &mut self,
        kind: TestKind,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        parallel: bool,
        channels: u8,
        wired: &mut Option<WiredChannel>,
    ) -> AppResult<RowStatus> {
        let settings = sheet.dcv_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        if chan > channels {
            return Ok(skipped(format!("UUT has no channel {}", chan)));
        }

        self.instruments.calibrator.set_voltage_dc(0.0).await?;
        if wired.map(|w| w.chan) != Some(chan) {
            self.wire_channel(chan, &settings, parallel, wired).await?;
        }
        self.configure_vertical(chan, &settings).await?;

        let reading = match kind {
            TestKind::DcvBalance => {
                let positive = self.source_and_measure(chan, settings.voltage.abs()).await?;
                let negative = self.source_and_measure(chan, -settings.voltage.abs()).await?;
                debug!(positive, negative, "DCV-BAL channel {}", chan);
                positive - negative
            }
            TestKind::Position => {
                self.instruments
                    .uut
                    .set_voltage_position(chan, settings.offset)
                    .await?;
                self.source_and_measure(chan, settings.voltage).await?
            }
            _ => {
                self.instruments.calibrator.operate().await?;
                self.pause(SOURCE_SETTLE).await;
                let zero = self.instruments.uut.read_cursor_avg().await?;
                let reading = self.source_and_measure(chan, settings.voltage).await?;
                let loaded = self.instruments.uut.read_cursor_avg().await?;
                self.cursor_readings.push(CursorReading {
                    chan,
                    scale: settings.scale,
                    delta: loaded - zero,
                });
                reading
            }
        };
        self.instruments.calibrator.standby().await?;

        let value = to_display_units(reading, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }

    /// Move the calibrator lead to `chan`, putting the previous channel back
    /// to its defaults first.
    async fn wire_channel(
        &mut self,
        chan: u8,
        settings: &DcvSettings,
        parallel: bool,
        wired: &mut Option<WiredChannel>,
    ) -> AppResult<()> {
        let uut = &mut self.instruments.uut;
        if let Some(previous) = wired.take() {
            uut.set_voltage_scale(previous.chan, 1.0, 1).await?;
            uut.set_voltage_offset(previous.chan, 0.0).await?;
            uut.set_channel(previous.chan, false).await?;
            if previous.impedance_changed {
                uut.set_channel_impedance(previous.chan, Impedance::OneMeg)
                    .await?;
            }
        }
        uut.set_channel(chan, true).await?;
        uut.set_voltage_scale(chan, 5.0, 1).await?;
        uut.set_voltage_offset(chan, 0.0).await?;
        if let Some(impedance) = settings.impedance {
            uut.set_channel_impedance(chan, impedance).await?;
        }
        uut.set_cursor_xy_source(chan, 1).await?;
        uut.set_cursor_position(Cursor::X1, 0.0).await?;
        if !parallel {
            self.operator
                .prompt(&format!("Connect calibrator output to channel {}", chan))
                .await?;
        }
        *wired = Some(WiredChannel {
            chan,
            impedance_changed: settings.impedance.is_some(),
        });
        Ok(())
    }

    /// Apply the row's coupling, bandwidth limit, inversion, scale and offset.
    async fn configure_vertical(&mut self, chan: u8, settings: &DcvSettings) -> AppResult<()> {
        let uut = &mut self.instruments.uut;
        uut.set_channel(chan, true).await?;
        uut.set_channel_coupling(chan, settings.coupling).await?;
        // Blank cells mean full bandwidth and no inversion.
        uut.set_channel_bw_limit(chan, settings.bandwidth.unwrap_or_default())
            .await?;
        uut.set_channel_invert(chan, settings.invert).await?;
        if settings.scale > 0.0 {
            uut.set_voltage_scale(chan, settings.scale, 1).await?;
        }
        uut.set_voltage_offset(chan, settings.offset).await
    }

    async fn source_and_measure(&mut self, chan: u8, volts: f64) -> AppResult<f64> {
        self.instruments.calibrator.set_voltage_dc(volts).await?;
        self.instruments.calibrator.operate().await?;
        self.pause(SOURCE_SETTLE).await;
        self.instruments.uut.measure_voltage(chan).await
    }

    /// Never leave the calibrator operating after a failed row.
    async fn standby_on_error(&mut self, result: AppResult<RowStatus>) -> AppResult<RowStatus> {
        if result.is_err() {
            if let Err(e) = self.instruments.calibrator.standby().await {
                warn!("Calibrator standby failed: {}", e);
            }
        }
        result
    }

    /// Back to one channel, full bandwidth, no inversion, 1 MΩ, then reset.
    async fn restore_vertical(&mut self, channels: u8, wired: Option<WiredChannel>) -> AppResult<()> {
        self.instruments.calibrator.standby().await?;
        let uut = &mut self.instruments.uut;
        for chan in 1..=channels {
            uut.set_channel(chan, chan == 1).await?;
            uut.set_channel_bw_limit(chan, BandwidthLimit::Full).await?;
            uut.set_channel_invert(chan, false).await?;
        }
        if let Some(WiredChannel {
            chan,
            impedance_changed: true,
        }) = wired
        {
            uut.set_channel_impedance(chan, Impedance::OneMeg).await?;
        }
        uut.reset().await
    }

    /// Mean level with no input applied.
    pub(super) async fn test_balance<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.run_open_input(TestKind::Balance, sheet, rows, progress)
            .await
    }

    /// RMS noise with no input applied, in sample mode.
    pub(super) async fn test_noise<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.run_open_input(TestKind::Noise, sheet, rows, progress)
            .await
    }

    async fn run_open_input<S: Sheet>(
        &mut self,
        kind: TestKind,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        let channels = self.instruments.uut.num_channels();
        self.instruments.calibrator.standby().await?;
        self.instruments.uut.reset().await?;
        self.operator
            .prompt("Disconnect all inputs from the UUT")
            .await?;
        let averages = if kind == TestKind::Noise { 1 } else { DC_AVERAGES };
        self.instruments.uut.set_acquisition(averages).await?;

        let mut outcome = Ok(());
        for &row in rows {
            let result = self.open_input_row(kind, sheet, row, channels).await;
            if let Err(e) = self.record(progress, row, kind, result) {
                outcome = Err(e);
                break;
            }
        }
        let restored = self.restore_vertical(channels, None).await;
        outcome.and(restored)
    }

    async fn open_input_row<S: Sheet>(
        &mut self,
        kind: TestKind,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        channels: u8,
    ) -> AppResult<RowStatus> {
        let settings = sheet.dcv_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        if chan > channels {
            return Ok(skipped(format!("UUT has no channel {}", chan)));
        }
        self.instruments.uut.set_only_channel(chan).await?;
        if let Some(impedance) = settings.impedance {
            self.instruments
                .uut
                .set_channel_impedance(chan, impedance)
                .await?;
        }
        self.configure_vertical(chan, &settings).await?;
        self.pause(SOURCE_SETTLE).await;

        let reading = if kind == TestKind::Noise {
            self.instruments.uut.measure_rms_noise(chan).await?
        } else {
            self.instruments.uut.measure_voltage(chan).await?
        };
        if settings.impedance == Some(Impedance::Fifty) {
            self.instruments
                .uut
                .set_channel_impedance(chan, Impedance::OneMeg)
                .await?;
        }

        let value = to_display_units(reading, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }

    /// Cursor deltas recorded during DCV, matched on channel and scale.
    pub(super) async fn test_cursor<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        for &row in rows {
            let result = self.cursor_row(sheet, row);
            self.record(progress, row, TestKind::Cursor, result)?;
        }
        Ok(())
    }

    fn cursor_row<S: Sheet>(&self, sheet: &mut ResultsSheet<S>, row: u32) -> AppResult<RowStatus> {
        let settings = sheet.dcv_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        let matching = self
            .cursor_readings
            .iter()
            .find(|r| r.chan == chan && same_scale(r.scale, settings.scale));
        let Some(reading) = matching else {
            return Ok(skipped(format!(
                "no DCV reading on channel {} at {} V/div",
                chan, settings.scale
            )));
        };
        let value = to_display_units(reading.delta, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }

    /// Input resistance with the 3458A on 2-wire ohms.
    pub(super) async fn test_impedance<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.instruments.dmm()?;
        let channels = self.instruments.uut.num_channels();
        self.instruments.uut.reset().await?;

        let mut wired = None;
        let mut outcome = Ok(());
        for &row in rows {
            let result = self.impedance_row(sheet, row, channels, &mut wired).await;
            if let Err(e) = self.record(progress, row, TestKind::Impedance, result) {
                outcome = Err(e);
                break;
            }
        }
        let mut restored = Ok(());
        if let Some(chan) = wired {
            restored = self
                .instruments
                .uut
                .set_channel_impedance(chan, Impedance::OneMeg)
                .await;
        }
        outcome.and(restored)
    }

    async fn impedance_row<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        channels: u8,
        wired: &mut Option<u8>,
    ) -> AppResult<RowStatus> {
        let settings = sheet.dcv_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        if chan > channels {
            return Ok(skipped(format!("UUT has no channel {}", chan)));
        }
        if *wired != Some(chan) {
            if let Some(previous) = wired.take() {
                self.instruments
                    .uut
                    .set_channel_impedance(previous, Impedance::OneMeg)
                    .await?;
            }
            self.operator
                .prompt(&format!("Connect the 3458A ohms input to channel {}", chan))
                .await?;
            *wired = Some(chan);
        }

        let impedance = settings.impedance.unwrap_or(Impedance::OneMeg);
        self.instruments.uut.set_only_channel(chan).await?;
        self.instruments
            .uut
            .set_channel_impedance(chan, impedance)
            .await?;
        self.pause(SOURCE_SETTLE).await;
        let stats = self
            .instruments
            .dmm()?
            .measure(DmmFunction::Ohm2W, OHMS_READINGS)
            .await?;
        debug!(
            average = stats.average,
            std_dev = stats.std_dev,
            "Channel {} input at {} Ω nominal",
            chan,
            impedance.ohms()
        );
        self.instruments
            .uut
            .set_channel_impedance(chan, Impedance::OneMeg)
            .await?;

        let value = to_display_units(stats.average, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }
}

fn same_scale(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_scale() {
        assert!(same_scale(0.005, 0.005));
        assert!(same_scale(0.1 + 0.2, 0.3));
        assert!(!same_scale(0.005, 0.01));
    }
}
