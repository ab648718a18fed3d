//! Horizontal and trigger tests, driven by the pulse and RF generators.

use super::{input_channel, instrument_age, skipped, tested, CalibrationRunner, Progress, RowStatus};
use crate::error::{AppResult, CalError};
use crate::instrument::scope::{Cursor, Impedance, TriggerSource};
use crate::instrument::Manufacturer;
use crate::workbook::{to_display_units, ChannelRef, ResultsSheet, Sheet, TestKind, TimebaseSettings};
use chrono::{Datelike, Local};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pulse period used by the timebase test, and the delay to the next edge.
const DELAY_PERIOD: f64 = 1e-3;

const TIMEBASE_PULSE_WIDTH: f64 = 200e-6;

const PULSE_AMPLITUDE: f64 = 1.0;

/// Timebase when a row leaves it blank.
const DEFAULT_TIMEBASE: f64 = 10e-9;

const RISE_READINGS: u32 = 10;

/// How long the trigger check waits for a sweep.
const TRIGGER_SWEEP: Duration = Duration::from_millis(100);

/// Probe scale for the trigger test when the row has none.
const TRIGGER_SCALE: f64 = 0.5;

/// Pass/Fail goes in column B of the trigger rows.
pub const TRIGGER_RESULT_COL: u32 = 2;

impl CalibrationRunner {
    /// Average of ten rise time readings on the fast pulse generator.
    pub(super) async fn test_rise_time<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        let channels = self.instruments.uut.num_channels();
        self.instruments.uut.reset().await?;
        let mut wired = None;
        let mut outcome = Ok(());
        for &row in rows {
            let result = self.rise_time_row(sheet, row, channels, &mut wired).await;
            if let Err(e) = self.record(progress, row, TestKind::RiseTime, result) {
                outcome = Err(e);
                break;
            }
        }
        let restored = self.instruments.uut.reset().await;
        outcome.and(restored)
    }

    async fn rise_time_row<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        channels: u8,
        wired: &mut Option<u8>,
    ) -> AppResult<RowStatus> {
        let settings = sheet.timebase_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        if chan > channels {
            return Ok(skipped(format!("UUT has no channel {}", chan)));
        }
        if *wired != Some(chan) {
            self.operator
                .prompt(&format!("Connect the fast pulse generator to channel {}", chan))
                .await?;
            *wired = Some(chan);
        }

        self.configure_horizontal(chan, &settings).await?;
        self.pause(Duration::from_millis(500)).await;
        let rise = self
            .instruments
            .uut
            .measure_risetime(chan, RISE_READINGS)
            .await?;
        if settings.impedance == Some(Impedance::Fifty) {
            self.instruments
                .uut
                .set_channel_impedance(chan, Impedance::OneMeg)
                .await?;
        }

        let value = to_display_units(rise, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }

    /// One channel on, impedance and bandwidth from the row, timebase in ns.
    async fn configure_horizontal(&mut self, chan: u8, settings: &TimebaseSettings) -> AppResult<()> {
        let uut = &mut self.instruments.uut;
        uut.set_only_channel(chan).await?;
        if let Some(impedance) = settings.impedance {
            uut.set_channel_impedance(chan, impedance).await?;
        }
        if let Some(limit) = settings.bandwidth {
            uut.set_channel_bw_limit(chan, limit).await?;
        }
        uut.set_timebase(timebase_seconds(settings)).await
    }

    /// Timebase accuracy in ppm, from the position of the pulse edge one
    /// period after the trigger.
    pub(super) async fn test_timebase<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.instruments.fgen()?;
        let mut outcome = Ok(());
        for &row in rows {
            let result = self.timebase_row(sheet, row).await;
            if let Err(e) = self.record(progress, row, TestKind::Timebase, result) {
                outcome = Err(e);
                break;
            }
        }
        let stopped = self.stop_pulse().await;
        let restored = self.instruments.uut.reset().await;
        outcome.and(stopped).and(restored)
    }

    async fn timebase_row<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        row: u32,
    ) -> AppResult<RowStatus> {
        let settings = sheet.timebase_settings(row)?;
        let chan = settings.channel.number().unwrap_or(1);
        self.operator
            .prompt(&format!("Connect 33250A output to channel {}", chan))
            .await?;

        let uut = &mut self.instruments.uut;
        uut.reset().await?;
        uut.set_channel(chan, true).await?;
        uut.set_voltage_scale(chan, 0.5, 1).await?;
        uut.set_voltage_offset(chan, 0.0).await?;
        uut.set_acquisition(32).await?;

        let fgen = self.instruments.fgen()?;
        fgen.set_pulse(DELAY_PERIOD, TIMEBASE_PULSE_WIDTH, PULSE_AMPLITUDE)
            .await?;
        fgen.enable_output(true).await?;

        self.instruments
            .uut
            .set_trigger_level(TriggerSource::Channel(chan), 0.0)
            .await?;
        self.instruments
            .uut
            .set_timebase(timebase_seconds(&settings))
            .await?;
        self.pause(Duration::from_millis(100)).await;
        self.instruments.uut.cursors_on().await?;
        self.pause(Duration::from_millis(1500)).await;

        let ref_x = self.instruments.uut.read_cursor(Cursor::X1).await?;
        let ref_y = self.instruments.uut.read_cursor(Cursor::Y1).await?;

        self.instruments.uut.set_timebase_pos(DELAY_PERIOD).await?;
        self.instruments
            .uut
            .set_cursor_position(Cursor::X1, DELAY_PERIOD)
            .await?;
        self.pause(Duration::from_secs(1)).await;
        self.instruments.uut.adjust_cursor(ref_y).await?;
        let offset_x = self.instruments.uut.read_cursor(Cursor::X1).await?;

        let error = ref_x - offset_x + DELAY_PERIOD;
        let ppm = error / DELAY_PERIOD * 1e6;
        info!(ref_x, ref_y, offset_x, ppm, "Timebase error");

        if self.instruments.uut.manufacturer() == Manufacturer::Keysight {
            let code = self
                .operator
                .ask_text("Enter date code from serial label (0 if no code)")
                .await?;
            let serial = self.instruments.uut.identity().serial.clone();
            let age = instrument_age(code.as_deref(), &serial, Local::now().year());
            if !sheet.write_named(&self.age_cell, age)? {
                sheet.write_result(row, age, 1);
            }
        }

        let col = sheet.find_results_col(row);
        sheet.write_result(row, ppm, col);
        Ok(tested(ppm))
    }

    async fn stop_pulse(&mut self) -> AppResult<()> {
        match self.instruments.fgen.as_mut() {
            Some(fgen) => fgen.enable_output(false).await,
            None => Ok(()),
        }
    }

    /// Trigger on a small RF signal: Pass if the UUT triggers.
    pub(super) async fn test_trigger_sensitivity<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.instruments.rfgen()?;
        let channels = self.instruments.uut.num_channels();
        self.instruments.uut.reset().await?;
        self.instruments.uut.set_only_channel(1).await?;

        // A 50 Ω channel 1 terminates the generator itself.
        let ext_termination = !rows.iter().any(|row| {
            sheet.trigger_settings(*row).is_ok_and(|s| {
                s.channel == ChannelRef::Channel(1) && s.impedance == Some(Impedance::Fifty)
            })
        });

        let mut outcome = Ok(());
        for &row in rows {
            let result = self
                .trigger_row(sheet, row, channels, ext_termination)
                .await;
            if let Err(e) = self.record(progress, row, TestKind::TriggerSensitivity, result) {
                outcome = Err(e);
                break;
            }
        }
        let stopped = match self.instruments.rfgen.as_mut() {
            Some(rfgen) => rfgen.set_output_state(false).await,
            None => Ok(()),
        };
        let restored = self.instruments.uut.reset().await;
        outcome.and(stopped).and(restored)
    }

    async fn trigger_row<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        channels: u8,
        ext_termination: bool,
    ) -> AppResult<RowStatus> {
        let settings = sheet.trigger_settings(row)?;
        if settings.frequency_mhz <= 0.0 {
            return Err(CalError::Workbook(format!(
                "Row {}: trigger frequency must be positive",
                row
            )));
        }
        if let ChannelRef::Channel(chan) = settings.channel {
            if chan > channels {
                return Ok(skipped(format!("UUT has no channel {}", chan)));
            }
        }

        let label = match settings.channel {
            ChannelRef::Channel(chan) => chan.to_string(),
            ChannelRef::External => "EXT".to_string(),
        };
        let message = if ext_termination || settings.channel.is_external() {
            format!("Connect signal generator output to channel {} via 50 Ohm feedthru", label)
        } else {
            format!("Connect signal generator output to channel {}", label)
        };
        self.operator.prompt(&message).await?;

        let rfgen = self.instruments.rfgen()?;
        rfgen.set_frequency_mhz(settings.frequency_mhz).await?;
        rfgen.set_level_mv(settings.voltage_mv).await?;
        rfgen.set_output_state(true).await?;

        let uut = &mut self.instruments.uut;
        match settings.channel {
            ChannelRef::Channel(chan) => {
                let scale = if settings.scale > 0.0 {
                    settings.scale
                } else {
                    TRIGGER_SCALE
                };
                uut.set_only_channel(chan).await?;
                uut.set_voltage_scale(chan, scale, 1).await?;
                uut.set_voltage_offset(chan, 0.0).await?;
                uut.set_trigger_level(TriggerSource::Channel(chan), 0.0)
                    .await?;
            }
            ChannelRef::External => {
                uut.set_channel(1, true).await?;
                uut.set_trigger_level(TriggerSource::External, 0.0).await?;
            }
        }
        debug!(edge = ?settings.edge, "Trigger edge for row {}", row);

        let period = 1.0 / (settings.frequency_mhz * 1e6);
        uut.set_timebase(period * 2.0).await?;
        let triggered = uut.check_triggered(TRIGGER_SWEEP).await?;
        if !triggered {
            warn!(
                "No trigger at {} mV, {} MHz on {}",
                settings.voltage_mv, settings.frequency_mhz, label
            );
        }

        let result = if triggered { "Pass" } else { "Fail" };
        sheet.write_result(row, result, TRIGGER_RESULT_COL);
        Ok(tested(result))
    }

    /// Period of a pulse train ten divisions long.
    pub(super) async fn test_delta_time<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        progress: &mut Progress,
    ) -> AppResult<()> {
        self.instruments.fgen()?;
        let channels = self.instruments.uut.num_channels();
        self.instruments.uut.reset().await?;
        let mut wired = None;
        let mut outcome = Ok(());
        for &row in rows {
            let result = self.delta_time_row(sheet, row, channels, &mut wired).await;
            if let Err(e) = self.record(progress, row, TestKind::DeltaTime, result) {
                outcome = Err(e);
                break;
            }
        }
        let stopped = self.stop_pulse().await;
        let restored = self.instruments.uut.reset().await;
        outcome.and(stopped).and(restored)
    }

    async fn delta_time_row<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        row: u32,
        channels: u8,
        wired: &mut Option<u8>,
    ) -> AppResult<RowStatus> {
        let settings = sheet.timebase_settings(row)?;
        let chan = input_channel(row, settings.channel)?;
        if chan > channels {
            return Ok(skipped(format!("UUT has no channel {}", chan)));
        }
        let Some(timebase_ns) = settings.timebase_ns else {
            return Err(CalError::Workbook(format!("Row {}: DTIME needs a timebase", row)));
        };
        if *wired != Some(chan) {
            self.operator
                .prompt(&format!("Connect 33250A output to channel {}", chan))
                .await?;
            *wired = Some(chan);
        }

        let period = timebase_ns / 1e9 * 10.0;
        let fgen = self.instruments.fgen()?;
        fgen.set_pulse(period, period / 5.0, PULSE_AMPLITUDE).await?;
        fgen.enable_output(true).await?;

        self.configure_horizontal(chan, &settings).await?;
        let uut = &mut self.instruments.uut;
        uut.set_voltage_scale(chan, 0.5, 1).await?;
        uut.set_voltage_offset(chan, 0.0).await?;
        uut.set_trigger_level(TriggerSource::Channel(chan), PULSE_AMPLITUDE / 2.0)
            .await?;
        self.pause(Duration::from_millis(500)).await;
        let measured = self.instruments.uut.measure_period(chan).await?;
        debug!(period, measured, "DTIME channel {}", chan);

        let value = to_display_units(measured, &sheet.units(row));
        sheet.write_result(row, value, 0);
        Ok(tested(value))
    }
}

fn timebase_seconds(settings: &TimebaseSettings) -> f64 {
    settings
        .timebase_ns
        .map(|ns| ns / 1e9)
        .unwrap_or(DEFAULT_TIMEBASE)
}
