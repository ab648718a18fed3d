//! Calibration sequencing
//!
//! [`CalibrationRunner`] takes a set of workbook rows, groups them by test
//! function and runs each group's procedure against the bench:
//!
//! ```text
//! rows ──► classify by TestKind ──► BAL, DCV, DCV-BAL, POS, CURS, RISE,
//!                                   TIME, TRIG, IMP, NOISE, DTIME
//!                                        │
//!              per row: settings ──► instruments ──► result cell
//!                                        │
//!              per group: save workbook, report progress
//! ```
//!
//! A failing row is recorded and the group moves on. An operator abort ends
//! the run. Every instrument is returned to local control at the end.

mod horizontal;
pub mod instruments;
pub mod report;
mod vertical;

pub use horizontal::TRIGGER_RESULT_COL;
pub use instruments::{check_connections, ConnectionStatus, Instruments};
pub use report::{RowOutcome, RowStatus, RunSummary};

use crate::error::{AppResult, CalError};
use crate::operator::Operator;
use crate::workbook::{ChannelRef, ResultsSheet, Sheet, TestKind};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// One calibrator output feeds every channel through a splitter.
    pub parallel_channels: bool,
    /// Leave rows that already have a result alone.
    pub skip_completed: bool,
}

/// Cursor delta recorded by the DCV procedure for the CURS rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CursorReading {
    pub chan: u8,
    pub scale: f64,
    pub delta: f64,
}

/// Row bookkeeping for one run.
pub(crate) struct Progress {
    done: usize,
    total: usize,
    summary: RunSummary,
}

/// Rows of the selected test functions, sorted, and whether any of them can
/// use the calibrator wired to all channels at once.
pub fn select_rows<S: Sheet>(
    sheet: &ResultsSheet<S>,
    selected: &[String],
) -> AppResult<(Vec<u32>, bool)> {
    let mut rows = BTreeSet::new();
    let mut parallel_capable = false;
    for name in selected {
        let kind: TestKind = name.parse()?;
        parallel_capable |= kind.supports_parallel_channels();
        rows.extend(sheet.rows_of_kind(kind));
    }
    Ok((rows.into_iter().collect(), parallel_capable))
}

/// Whether the calibrator will feed every channel at once. Only asked when
/// a parallel-capable test is selected and the wiring was not given up front.
pub async fn choose_parallel(
    operator: &mut dyn Operator,
    requested: bool,
    capable: bool,
) -> AppResult<bool> {
    if !capable {
        return Ok(false);
    }
    if requested {
        return Ok(true);
    }
    operator
        .confirm("Will you connect all channels in parallel?")
        .await
}

pub struct CalibrationRunner {
    instruments: Instruments,
    operator: Box<dyn Operator>,
    cursor_readings: Vec<CursorReading>,
    age_cell: String,
}

impl CalibrationRunner {
    pub fn new(instruments: Instruments, operator: Box<dyn Operator>) -> Self {
        Self {
            instruments,
            operator,
            cursor_readings: Vec::new(),
            age_cell: "Age".to_string(),
        }
    }

    /// Named range receiving the UUT age after the timebase test.
    pub fn with_age_cell(mut self, name: impl Into<String>) -> Self {
        self.age_cell = name.into();
        self
    }

    pub fn instruments(&mut self) -> &mut Instruments {
        &mut self.instruments
    }

    pub fn into_instruments(self) -> Instruments {
        self.instruments
    }

    /// Run `rows` and write their results into `sheet`.
    pub async fn run_tests<S: Sheet>(
        &mut self,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        options: RunOptions,
    ) -> AppResult<RunSummary> {
        let mut summary = RunSummary::new();
        let mut groups: BTreeMap<TestKind, Vec<u32>> = BTreeMap::new();
        for row in rows.iter().copied().collect::<BTreeSet<u32>>() {
            let function = sheet.function(row);
            match sheet.kind(row) {
                None => summary.push(
                    row,
                    function,
                    RowStatus::Skipped {
                        reason: "unsupported function".into(),
                    },
                ),
                Some(kind) if options.skip_completed && completed(sheet, row, kind) => summary.push(
                    row,
                    function,
                    RowStatus::Skipped {
                        reason: "result already present".into(),
                    },
                ),
                Some(kind) => groups.entry(kind).or_default().push(row),
            }
        }

        let mut progress = Progress {
            done: 0,
            total: groups.values().map(Vec::len).sum(),
            summary,
        };
        info!(
            rows = progress.total,
            groups = groups.len(),
            parallel = options.parallel_channels,
            "Starting calibration run"
        );

        let mut aborted = false;
        for (kind, rows) in &groups {
            info!("Running {} on rows {:?}", kind, rows);
            let outcome = self
                .run_group(*kind, sheet, rows, options, &mut progress)
                .await;
            let saved = sheet.save();
            match outcome {
                Ok(()) => {}
                Err(CalError::Aborted) => {
                    warn!("Run aborted by operator during {}", kind);
                    aborted = true;
                }
                Err(e) => {
                    warn!("{} stopped: {}", kind, e);
                    for row in rows {
                        if !progress.summary.contains(*row) {
                            progress.summary.push(
                                *row,
                                kind.as_str(),
                                RowStatus::Failed {
                                    error: e.to_string(),
                                },
                            );
                        }
                    }
                }
            }
            if let Err(e) = saved {
                warn!("Could not save workbook after {}: {}", kind, e);
            }
            if aborted {
                break;
            }
        }

        if aborted {
            for rows in groups.values() {
                for row in rows {
                    if !progress.summary.contains(*row) {
                        progress.summary.push(
                            *row,
                            sheet.function(*row),
                            RowStatus::Skipped {
                                reason: "aborted".into(),
                            },
                        );
                    }
                }
            }
        }

        self.instruments.local_all().await;
        let mut summary = progress.summary;
        summary.aborted = aborted;
        summary.finish();
        info!(
            tested = summary.tested(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "Calibration run finished"
        );
        Ok(summary)
    }

    async fn run_group<S: Sheet>(
        &mut self,
        kind: TestKind,
        sheet: &mut ResultsSheet<S>,
        rows: &[u32],
        options: RunOptions,
        progress: &mut Progress,
    ) -> AppResult<()> {
        let parallel = options.parallel_channels;
        match kind {
            TestKind::Balance => self.test_balance(sheet, rows, progress).await,
            TestKind::Dcv => self.test_dcv(sheet, rows, parallel, progress).await,
            TestKind::DcvBalance => self.test_dcv_balance(sheet, rows, parallel, progress).await,
            TestKind::Position => self.test_position(sheet, rows, parallel, progress).await,
            TestKind::Cursor => self.test_cursor(sheet, rows, progress).await,
            TestKind::RiseTime => self.test_rise_time(sheet, rows, progress).await,
            TestKind::Timebase => self.test_timebase(sheet, rows, progress).await,
            TestKind::TriggerSensitivity => self.test_trigger_sensitivity(sheet, rows, progress).await,
            TestKind::Impedance => self.test_impedance(sheet, rows, progress).await,
            TestKind::Noise => self.test_noise(sheet, rows, progress).await,
            TestKind::DeltaTime => self.test_delta_time(sheet, rows, progress).await,
        }
    }

    /// Record the outcome of one row and report progress. An abort is passed
    /// back to stop the group.
    fn record(
        &mut self,
        progress: &mut Progress,
        row: u32,
        kind: TestKind,
        result: AppResult<RowStatus>,
    ) -> AppResult<()> {
        let status = match result {
            Ok(status) => status,
            Err(CalError::Aborted) => return Err(CalError::Aborted),
            Err(e) => {
                warn!("{} row {} failed: {}", kind, row, e);
                RowStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        progress.summary.push(row, kind.as_str(), status);
        progress.done += 1;
        self.operator
            .progress(progress.done, progress.total, &format!("{} row {}", kind, row));
        Ok(())
    }

    /// Settling time between stimulus and reading. Skipped on simulated
    /// benches.
    async fn pause(&self, duration: Duration) {
        if !self.instruments.uut.is_simulating() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Whether `row` already holds a result where `kind` writes it.
fn completed<S: Sheet>(sheet: &ResultsSheet<S>, row: u32, kind: TestKind) -> bool {
    match kind {
        TestKind::TriggerSensitivity => !sheet.sheet().cell(TRIGGER_RESULT_COL, row).is_empty(),
        _ => sheet.has_result(row),
    }
}

/// Vertical and timing tests need a numbered input.
fn input_channel(row: u32, channel: ChannelRef) -> AppResult<u8> {
    channel
        .number()
        .ok_or_else(|| CalError::Workbook(format!("Row {}: EXT is not a measurement input", row)))
}

/// Age in whole years of a Keysight scope.
///
/// `code` is the YYMM date code from the serial label. A code of `0`, or one
/// from the future, means "no code": the date is then taken from the serial
/// number, which has two site letters and four digits counting from 1960
/// (`4000` is January 2000). A missing or short serial leaves the age at the
/// years since 2000. An unreadable code or serial counts as ten years.
pub fn instrument_age(code: Option<&str>, serial: &str, this_year: i32) -> i64 {
    let since_2000 = i64::from(this_year - 2000);
    let years = since_2000 as f64;
    let mut age = 10.0;
    let code = match code.and_then(|c| c.trim().parse::<i64>().ok()) {
        Some(c) => {
            let c = if c.div_euclid(100) > since_2000 { 0 } else { c };
            age = years - c as f64 / 100.0;
            c
        }
        None => 0,
    };
    if code == 0 && serial.len() >= 10 {
        age = serial
            .get(2..6)
            .and_then(|digits| digits.parse::<i64>().ok())
            .map(|date| years - (date - 4000) as f64 / 100.0)
            .unwrap_or(10.0);
    }
    (age + 0.5) as i64
}

fn tested(value: impl ToString) -> RowStatus {
    RowStatus::Tested {
        result: value.to_string(),
    }
}

fn skipped(reason: impl Into<String>) -> RowStatus {
    RowStatus::Skipped {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkbookConfig;
    use crate::operator::ScriptedOperator;
    use crate::workbook::MemorySheet;

    fn sheet() -> ResultsSheet<MemorySheet> {
        let mut sheet = MemorySheet::new();
        sheet.define_name("StartCell", "J12");
        sheet.set_row(12, 10, &["DCV", "1"]);
        sheet.set_row(13, 10, &["DCV-BAL", "1"]);
        sheet.set_row(14, 10, &["TIME", "1"]);
        sheet.set_row(15, 10, &["DCV", "2"]);
        sheet.set_row(16, 10, &["CURS", "1"]);
        ResultsSheet::new(sheet, &WorkbookConfig::default())
    }

    #[test]
    fn test_select_rows_exact_functions() {
        let sheet = sheet();
        let (rows, parallel) = select_rows(&sheet, &["DCV".into(), "TIME".into()]).unwrap();
        assert_eq!(rows, vec![12, 14, 15]);
        assert!(parallel);

        let (rows, parallel) = select_rows(&sheet, &["TIME".into()]).unwrap();
        assert_eq!(rows, vec![14]);
        assert!(!parallel);

        let (rows, parallel) = select_rows(&sheet, &["CURS".into(), "curs".into()]).unwrap();
        assert_eq!(rows, vec![16]);
        assert!(parallel);
    }

    #[test]
    fn test_instrument_age_from_date_code() {
        assert_eq!(instrument_age(Some("2105"), "MY58490123", 2026), 5);
        assert_eq!(instrument_age(Some(" 1812 "), "", 2026), 8);
    }

    #[test]
    fn test_instrument_age_from_serial() {
        // 5849 - 4000 = 18.49 years after 2000
        assert_eq!(instrument_age(Some("0"), "MY58490123", 2026), 8);
        assert_eq!(instrument_age(None, "MY58490123", 2026), 8);
        // A code from the future is ignored.
        assert_eq!(instrument_age(Some("2805"), "MY58490123", 2026), 8);
        assert_eq!(instrument_age(Some("n/a"), "MY58490123", 2026), 8);
    }

    #[test]
    fn test_instrument_age_defaults_to_ten() {
        assert_eq!(instrument_age(None, "", 2026), 10);
        assert_eq!(instrument_age(Some("n/a"), "MY5849", 2026), 10);
        assert_eq!(instrument_age(None, "MYAB490123", 2026), 10);
    }

    #[test]
    fn test_instrument_age_zero_code_without_serial_date() {
        // No code and no usable serial: counted from 2000.
        assert_eq!(instrument_age(Some("0"), "MY5849", 2026), 26);
        assert_eq!(instrument_age(Some("2805"), "", 2026), 26);
    }

    #[tokio::test]
    async fn test_parallel_wiring_asked_only_when_it_matters() {
        let mut operator = ScriptedOperator::new().confirming(true);
        assert!(!choose_parallel(&mut operator, true, false).await.unwrap());
        assert!(choose_parallel(&mut operator, true, true).await.unwrap());
        assert!(operator.transcript().is_empty());

        assert!(choose_parallel(&mut operator, false, true).await.unwrap());
        assert_eq!(
            operator.transcript(),
            vec!["Will you connect all channels in parallel?"]
        );

        let mut declining = ScriptedOperator::new();
        assert!(!choose_parallel(&mut declining, false, true).await.unwrap());
    }

    #[test]
    fn test_select_rows_rejects_unknown_function() {
        assert!(matches!(
            select_rows(&sheet(), &["SWEEP".into()]),
            Err(CalError::Workbook(_))
        ));
    }
}
