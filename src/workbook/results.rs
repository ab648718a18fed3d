//! Test-plan view of a results workbook.

use super::{CellValue, Sheet, TestKind};
use crate::config::WorkbookConfig;
use crate::error::{AppResult, CalError};
use crate::instrument::scope::{BandwidthLimit, Coupling, Impedance};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Header rows never hold test settings; result headings are not searched above this.
const HEADER_FLOOR: u32 = 10;

/// Rows above a test searched for a result heading.
const HEADING_SEARCH_ROWS: u32 = 4;

/// Columns searched for a result heading.
const HEADING_SEARCH_COLS: std::ops::Range<u32> = 1..10;

/// Channel column: an input number or the external trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRef {
    Channel(u8),
    External,
}

impl ChannelRef {
    pub fn number(&self) -> Option<u8> {
        match self {
            Self::Channel(n) => Some(*n),
            Self::External => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}

impl FromStr for ChannelRef {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.eq_ignore_ascii_case("EXT") {
            return Ok(Self::External);
        }
        let number = text
            .strip_prefix("CH")
            .or_else(|| text.strip_prefix("ch"))
            .unwrap_or(text)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| *n >= 1.0 && *n <= 8.0 && n.fract() == 0.0);
        number
            .map(|n| Self::Channel(n as u8))
            .ok_or_else(|| CalError::Workbook(format!("Invalid channel '{}'", text)))
    }
}

/// Trigger edge; anything but `F` is rising.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

/// Settings for the vertical tests (DCV, BAL, DCV-BAL, POS, CURS, IMP, NOISE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcvSettings {
    pub function: String,
    pub channel: ChannelRef,
    pub coupling: Coupling,
    /// V/div
    pub scale: f64,
    /// Applied voltage
    pub voltage: f64,
    /// Offset in volts (divisions for POS)
    pub offset: f64,
    pub bandwidth: Option<BandwidthLimit>,
    pub impedance: Option<Impedance>,
    pub invert: bool,
}

/// Settings for the horizontal tests (TIME, RISE, DTIME).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimebaseSettings {
    pub function: String,
    pub channel: ChannelRef,
    /// s/div in nanoseconds
    pub timebase_ns: Option<f64>,
    pub impedance: Option<Impedance>,
    pub bandwidth: Option<BandwidthLimit>,
}

/// Settings for trigger sensitivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub function: String,
    pub channel: ChannelRef,
    pub scale: f64,
    /// Signal level in mV RMS
    pub voltage_mv: f64,
    pub impedance: Option<Impedance>,
    pub frequency_mhz: f64,
    pub edge: Edge,
}

/// Reads test settings from, and writes results into, a [`Sheet`].
pub struct ResultsSheet<S: Sheet> {
    sheet: S,
    data_col: u32,
    result_col: u32,
    units_col: u32,
    default_start_row: u32,
    max_row: u32,
    start_cell: String,
    first_row: u32,
    row: u32,
}

impl<S: Sheet> ResultsSheet<S> {
    pub fn new(sheet: S, layout: &WorkbookConfig) -> Self {
        let mut results = Self {
            sheet,
            data_col: layout.datacol,
            result_col: layout.resultcol,
            units_col: layout.unitscol,
            default_start_row: layout.startrow,
            max_row: layout.maxrow,
            start_cell: layout.startcell.clone(),
            first_row: layout.startrow,
            row: layout.startrow,
        };
        results.initialize();
        results
    }

    /// Move back to the first test row.
    ///
    /// The first row comes from the start cell named range (which also fixes
    /// the data column), then from an integer in row 1 of the data column,
    /// then from the configured default.
    pub fn initialize(&mut self) {
        if let Some((col, row)) = self.sheet.defined_name(&self.start_cell) {
            self.data_col = col;
            self.first_row = row;
        } else if let Some(row) = self
            .sheet
            .cell(self.data_col, 1)
            .as_f64()
            .filter(|r| *r >= 1.0 && r.fract() == 0.0)
        {
            self.first_row = row as u32;
        } else {
            self.first_row = self.default_start_row;
        }
        self.row = self.first_row;
        debug!(row = self.row, col = self.data_col, "workbook initialised");
    }

    pub fn sheet(&self) -> &S {
        &self.sheet
    }

    pub fn sheet_mut(&mut self) -> &mut S {
        &mut self.sheet
    }

    pub fn into_inner(self) -> S {
        self.sheet
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn set_row(&mut self, row: u32) {
        self.row = row;
    }

    pub fn data_col(&self) -> u32 {
        self.data_col
    }

    /// Function name in the data column of `row`.
    pub fn function(&self, row: u32) -> String {
        self.sheet.cell(self.data_col, row).as_text()
    }

    /// Supported test kind of `row`, if any.
    pub fn kind(&self, row: u32) -> Option<TestKind> {
        self.function(row).parse().ok()
    }

    fn find_next(&self, from: u32, supported_only: bool) -> Option<u32> {
        ((from + 1)..self.max_row).find(|row| {
            let function = self.function(*row);
            !function.is_empty() && (!supported_only || TestKind::from_str(&function).is_ok())
        })
    }

    /// Advance to the next row with a function (a supported one if
    /// `supported_only`). Returns false once `max_row` is reached.
    pub fn next_row(&mut self, supported_only: bool) -> bool {
        match self.find_next(self.row, supported_only) {
            Some(row) => {
                self.row = row;
                true
            }
            None => {
                self.row = self.max_row;
                false
            }
        }
    }

    /// First row followed by every subsequent row with a function.
    fn scan(&self, supported_only: bool) -> Vec<u32> {
        let mut rows = vec![self.first_row];
        let mut row = self.first_row;
        while let Some(next) = self.find_next(row, supported_only) {
            rows.push(next);
            row = next;
        }
        rows
    }

    /// Number of test rows, for progress reporting.
    pub fn number_of_tests(&self) -> usize {
        self.scan(true).len()
    }

    /// Rows whose function matches `filter`, a regular expression in which
    /// `*` stands for any character.
    pub fn test_rows(&self, filter: &str) -> AppResult<Vec<u32>> {
        let pattern = filter.replace('*', ".");
        let re = Regex::new(&pattern)
            .map_err(|e| CalError::InvalidArgument(format!("Invalid test filter '{}': {}", filter, e)))?;
        Ok(self
            .scan(true)
            .into_iter()
            .filter(|row| re.is_match(&self.function(*row)))
            .collect())
    }

    /// Rows of exactly `kind`.
    pub fn rows_of_kind(&self, kind: TestKind) -> Vec<u32> {
        self.scan(true)
            .into_iter()
            .filter(|row| self.kind(*row) == Some(kind))
            .collect()
    }

    /// Distinct function names, in the order first seen.
    pub fn test_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for row in self.scan(true) {
            let function = self.function(row);
            if !function.is_empty() && !types.contains(&function) {
                types.push(function);
            }
        }
        types
    }

    /// `(function, row)` for every row whose function is not supported.
    pub fn invalid_tests(&self) -> Vec<(String, u32)> {
        self.scan(false)
            .into_iter()
            .filter_map(|row| {
                let function = self.function(row);
                (!function.is_empty() && TestKind::from_str(&function).is_err())
                    .then_some((function, row))
            })
            .collect()
    }

    /// Whether the sheet defines the start cell named range.
    pub fn check_valid_results(&self) -> bool {
        self.sheet.defined_name(&self.start_cell).is_some()
    }

    fn setting(&self, row: u32, offset: u32) -> CellValue {
        self.sheet.cell(self.data_col + offset, row)
    }

    fn number(&self, row: u32, offset: u32) -> f64 {
        self.setting(row, offset).as_f64().unwrap_or(0.0)
    }

    fn channel(&self, row: u32, offset: u32) -> AppResult<ChannelRef> {
        self.setting(row, offset)
            .as_text()
            .parse()
            .map_err(|e| CalError::Workbook(format!("Row {}: {}", row, e)))
    }

    fn optional<T: FromStr<Err = CalError>>(&self, row: u32, offset: u32) -> AppResult<Option<T>> {
        let text = self.setting(row, offset).as_text();
        if text.is_empty() {
            return Ok(None);
        }
        text.parse()
            .map(Some)
            .map_err(|e| CalError::Workbook(format!("Row {}: {}", row, e)))
    }

    /// Function, channel, coupling, scale, voltage, offset, bandwidth,
    /// impedance, invert.
    pub fn dcv_settings(&self, row: u32) -> AppResult<DcvSettings> {
        let invert = self.setting(row, 8).as_text();
        Ok(DcvSettings {
            function: self.function(row),
            channel: self.channel(row, 1)?,
            coupling: self.optional(row, 2)?.unwrap_or_default(),
            scale: self.number(row, 3),
            voltage: self.number(row, 4),
            offset: self.number(row, 5),
            bandwidth: self.optional(row, 6)?,
            impedance: self.optional(row, 7)?,
            invert: invert.eq_ignore_ascii_case("y") || invert == "1",
        })
    }

    /// Function, channel, timebase (ns), impedance, bandwidth.
    pub fn timebase_settings(&self, row: u32) -> AppResult<TimebaseSettings> {
        Ok(TimebaseSettings {
            function: self.function(row),
            channel: self.channel(row, 1)?,
            timebase_ns: self.setting(row, 2).as_f64().filter(|tb| *tb > 0.0),
            impedance: self.optional(row, 3)?,
            bandwidth: self.optional(row, 4)?,
        })
    }

    /// Function, channel, scale, voltage (mV), impedance, frequency (MHz), edge.
    pub fn trigger_settings(&self, row: u32) -> AppResult<TriggerSettings> {
        let edge = if self.setting(row, 6).as_text().eq_ignore_ascii_case("f") {
            Edge::Falling
        } else {
            Edge::Rising
        };
        Ok(TriggerSettings {
            function: self.function(row),
            channel: self.channel(row, 1)?,
            scale: self.number(row, 2),
            voltage_mv: self.number(row, 3),
            impedance: self.optional(row, 4)?,
            frequency_mhz: self.number(row, 5),
            edge,
        })
    }

    /// Units text for `row`.
    pub fn units(&self, row: u32) -> String {
        self.sheet.cell(self.units_col, row).as_text()
    }

    /// Column of the nearest result heading above `row`, or 0 if none.
    ///
    /// Some sheets have comment rows between the heading and the tests, so
    /// up to four rows are searched.
    pub fn find_results_col(&self, row: u32) -> u32 {
        for above in 1..=HEADING_SEARCH_ROWS {
            let Some(heading_row) = row.checked_sub(above).filter(|r| *r >= HEADER_FLOOR) else {
                return 0;
            };
            for col in HEADING_SEARCH_COLS {
                let heading = self.sheet.cell(col, heading_row).as_text().to_lowercase();
                if heading.contains("result") || heading.contains("measured") {
                    return col;
                }
            }
        }
        0
    }

    /// Write `value` into `row`, in `col` or the default result column when 0.
    pub fn write_result(&mut self, row: u32, value: impl Into<CellValue>, col: u32) {
        let col = if col == 0 { self.result_col } else { col };
        self.sheet.set_cell(col, row, value.into());
    }

    pub fn read_result(&self, row: u32) -> CellValue {
        self.sheet.cell(self.result_col, row)
    }

    /// Whether `row` already has a result, under its heading or in the
    /// default result column.
    pub fn has_result(&self, row: u32) -> bool {
        let heading = self.find_results_col(row);
        !self.read_result(row).is_empty()
            || (heading != 0 && !self.sheet.cell(heading, row).is_empty())
    }

    /// Write into the top-left cell of a named range and save. Returns false
    /// if the name is not defined.
    pub fn write_named(&mut self, name: &str, value: impl Into<CellValue>) -> AppResult<bool> {
        match self.sheet.defined_name(name) {
            Some((col, row)) => {
                self.sheet.set_cell(col, row, value.into());
                self.sheet.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn save(&mut self) -> AppResult<()> {
        self.sheet.save()
    }

    pub fn backup(&self) -> AppResult<Option<PathBuf>> {
        self.sheet.backup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::MemorySheet;

    fn layout() -> WorkbookConfig {
        WorkbookConfig::default()
    }

    /// Data column J (10), tests from row 12.
    fn plan() -> MemorySheet {
        let mut sheet = MemorySheet::new();
        sheet.define_name("StartCell", "J12");
        sheet.set_cell(4, 11, "Result".into());
        sheet.set_row(12, 10, &["DCV", "1", "DC", "0.005", "0.02", "0", "20", "1M", "n"]);
        sheet.set_cell(6, 12, "mV".into());
        sheet.set_row(13, 10, &["DCV-BAL", "2", "", "1", "3", "", "", "50", "Y"]);
        sheet.set_row(15, 10, &["XYZ"]);
        sheet.set_row(16, 10, &["TIME", "1", "100", "1M"]);
        sheet.set_row(18, 10, &["TRIG", "EXT", "0.5", "15", "50", "100", "f"]);
        sheet.set_row(19, 10, &["DCV", "2", "DC", "1", "3"]);
        sheet
    }

    #[test]
    fn test_start_cell_sets_row_and_column() {
        let mut sheet = plan();
        sheet.define_name("StartCell", "K12");
        let results = ResultsSheet::new(sheet, &layout());
        assert_eq!(results.row(), 12);
        assert_eq!(results.data_col(), 11);
        assert!(results.check_valid_results());
    }

    #[test]
    fn test_start_row_from_first_row_then_default() {
        let mut sheet = MemorySheet::new();
        sheet.set_cell(10, 1, CellValue::Number(20.0));
        let results = ResultsSheet::new(sheet, &layout());
        assert_eq!(results.row(), 20);
        assert!(!results.check_valid_results());

        let results = ResultsSheet::new(MemorySheet::new(), &layout());
        assert_eq!(results.row(), 10);
    }

    #[test]
    fn test_next_row_skips_unsupported() {
        let mut results = ResultsSheet::new(plan(), &layout());
        assert!(results.next_row(true));
        assert_eq!(results.row(), 13);
        assert!(results.next_row(true));
        assert_eq!(results.row(), 16);
        assert!(results.next_row(false));
        assert_eq!(results.row(), 18);
        assert!(results.next_row(true));
        assert!(!results.next_row(true));
        assert_eq!(results.row(), 1000);
    }

    #[test]
    fn test_filters_and_types() {
        let results = ResultsSheet::new(plan(), &layout());
        assert_eq!(results.number_of_tests(), 5);
        assert_eq!(results.test_rows("*").unwrap(), vec![12, 13, 16, 18, 19]);
        // A plain filter is a regex search, so DCV also finds DCV-BAL.
        assert_eq!(results.test_rows("DCV").unwrap(), vec![12, 13, 19]);
        assert_eq!(results.test_rows("^DCV$").unwrap(), vec![12, 19]);
        assert!(results.test_rows("(").is_err());
        assert_eq!(results.rows_of_kind(TestKind::Dcv), vec![12, 19]);
        assert_eq!(results.test_types(), vec!["DCV", "DCV-BAL", "TIME", "TRIG"]);
        assert_eq!(results.invalid_tests(), vec![("XYZ".to_string(), 15)]);
    }

    #[test]
    fn test_dcv_settings_columns() {
        let results = ResultsSheet::new(plan(), &layout());
        let dcv = results.dcv_settings(12).unwrap();
        assert_eq!(dcv.channel, ChannelRef::Channel(1));
        assert_eq!(dcv.coupling, Coupling::Dc);
        assert_eq!(dcv.scale, 0.005);
        assert_eq!(dcv.voltage, 0.02);
        assert_eq!(dcv.bandwidth, Some(BandwidthLimit::Mhz(20)));
        assert_eq!(dcv.impedance, Some(Impedance::OneMeg));
        assert!(!dcv.invert);

        let bal = results.dcv_settings(13).unwrap();
        assert_eq!(bal.impedance, Some(Impedance::Fifty));
        assert_eq!(bal.bandwidth, None);
        assert!(bal.invert);
    }

    #[test]
    fn test_timebase_and_trigger_settings() {
        let results = ResultsSheet::new(plan(), &layout());
        let tb = results.timebase_settings(16).unwrap();
        assert_eq!(tb.timebase_ns, Some(100.0));
        assert_eq!(tb.impedance, Some(Impedance::OneMeg));

        let trig = results.trigger_settings(18).unwrap();
        assert!(trig.channel.is_external());
        assert_eq!(trig.voltage_mv, 15.0);
        assert_eq!(trig.impedance, Some(Impedance::Fifty));
        assert_eq!(trig.frequency_mhz, 100.0);
        assert_eq!(trig.edge, Edge::Falling);
    }

    #[test]
    fn test_bad_channel_is_workbook_error() {
        let mut sheet = plan();
        sheet.set_row(12, 11, &["nine"]);
        let results = ResultsSheet::new(sheet, &layout());
        assert!(matches!(results.dcv_settings(12), Err(CalError::Workbook(_))));
    }

    #[test]
    fn test_find_results_col() {
        let mut sheet = plan();
        sheet.set_cell(3, 40, "Measured Value".into());
        let results = ResultsSheet::new(sheet, &layout());
        assert_eq!(results.find_results_col(12), 4);
        assert_eq!(results.find_results_col(44), 3);
        // Five rows below the heading is out of reach.
        assert_eq!(results.find_results_col(45), 0);
        // Never looks into the header rows.
        assert_eq!(results.find_results_col(10), 0);
    }

    #[test]
    fn test_write_result_and_named() {
        let mut sheet = plan();
        sheet.define_name("Age", "B5");
        let mut results = ResultsSheet::new(sheet, &layout());
        results.write_result(12, 12.3, 0);
        results.write_result(18, "Pass", 2);
        assert_eq!(results.read_result(12), CellValue::Number(12.3));
        assert_eq!(results.sheet().cell(2, 18), CellValue::Text("Pass".into()));
        assert!(results.write_named("Age", 7i64).unwrap());
        assert!(!results.write_named("Missing", 1i64).unwrap());
        assert_eq!(results.sheet().cell(2, 5), CellValue::Number(7.0));
        assert_eq!(results.sheet().save_count(), 1);
    }

    #[test]
    fn test_has_result_checks_heading_column() {
        let mut sheet = plan();
        sheet.set_cell(3, 11, "Measured".into());
        sheet.set_cell(3, 13, CellValue::Number(0.5));
        let mut results = ResultsSheet::new(sheet, &layout());
        assert!(!results.has_result(12));
        assert!(results.has_result(13));
        results.write_result(12, 1.0, 0);
        assert!(results.has_result(12));
    }
}
