//! Results workbook access
//!
//! A results workbook is a grid of cells. Each test row carries its settings
//! in consecutive columns starting at the data column, and receives its
//! measured value in the result column. Cell storage sits behind [`Sheet`]:
//! - [`MemorySheet`]: an in-memory grid (tests, dry runs)
//! - [`CsvSheet`]: a CSV export of the workbook
//!
//! [`ResultsSheet`] layers the test-plan conventions on top of any sheet.

pub mod csv_sheet;
pub mod memory;
pub mod results;

pub use csv_sheet::CsvSheet;
pub use memory::MemorySheet;
pub use results::{
    ChannelRef, DcvSettings, Edge, ResultsSheet, TimebaseSettings, TriggerSettings,
};

use crate::error::{AppResult, CalError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Contents of one cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Interpret raw text the way a spreadsheet would: blank, number or text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::Empty
        } else if let Ok(number) = trimmed.parse::<f64>() {
            Self::Number(number)
        } else {
            Self::Text(raw.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::Number(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Empty => None,
        }
    }

    /// Cell contents as trimmed text; numbers use their shortest form.
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Number(number) => number.to_string(),
            Self::Text(text) => text.trim().to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// 1-based `(column, row)` from an A1-style reference such as `J12` or `$J$12`.
pub fn parse_coordinate(reference: &str) -> Option<(u32, u32)> {
    let cleaned: String = reference
        .trim()
        .chars()
        .filter(|c| *c != '$')
        .collect::<String>()
        .to_ascii_uppercase();
    let split = cleaned.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cleaned.split_at(split);
    if letters.is_empty() || letters.len() > 3 || !letters.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let col = letters
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c as u32 - 'A' as u32 + 1));
    let row = digits.parse::<u32>().ok().filter(|r| *r > 0)?;
    Some((col, row))
}

/// Column letters for a 1-based column index (`10` -> `J`).
pub fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        col = (col - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Cell storage behind a results workbook. Coordinates are 1-based.
pub trait Sheet: Send {
    fn cell(&self, col: u32, row: u32) -> CellValue;

    fn set_cell(&mut self, col: u32, row: u32, value: CellValue);

    /// Top-left cell of a named range.
    fn defined_name(&self, name: &str) -> Option<(u32, u32)>;

    /// Persist pending changes.
    fn save(&mut self) -> AppResult<()>;

    /// Write a timestamped copy next to the workbook. Returns its path, or
    /// `None` for sheets without backing storage.
    fn backup(&self) -> AppResult<Option<PathBuf>>;
}

/// Functions the sequencer can run, in the order they are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestKind {
    Balance,
    Dcv,
    DcvBalance,
    Position,
    Cursor,
    RiseTime,
    Timebase,
    TriggerSensitivity,
    Impedance,
    Noise,
    DeltaTime,
}

impl TestKind {
    /// Every supported function in sequence-preference order.
    pub const ALL: [TestKind; 11] = [
        Self::Balance,
        Self::Dcv,
        Self::DcvBalance,
        Self::Position,
        Self::Cursor,
        Self::RiseTime,
        Self::Timebase,
        Self::TriggerSensitivity,
        Self::Impedance,
        Self::Noise,
        Self::DeltaTime,
    ];

    /// Function name as written in the workbook.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balance => "BAL",
            Self::Dcv => "DCV",
            Self::DcvBalance => "DCV-BAL",
            Self::Position => "POS",
            Self::Cursor => "CURS",
            Self::RiseTime => "RISE",
            Self::Timebase => "TIME",
            Self::TriggerSensitivity => "TRIG",
            Self::Impedance => "IMP",
            Self::Noise => "NOISE",
            Self::DeltaTime => "DTIME",
        }
    }

    /// Kinds that can use the calibrator wired to every channel at once.
    pub fn supports_parallel_channels(&self) -> bool {
        matches!(self, Self::Dcv | Self::DcvBalance | Self::Cursor)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestKind {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| CalError::Workbook(format!("Unsupported test function '{}'", s.trim())))
    }
}

/// Convert an SI value into the units named in a units cell.
///
/// The prefix of `units` (`p`, `n`, `u`/`µ`, `m`, `k`, `M`, `G`) is applied
/// when the rest is a known base unit (V, s, Hz, Ohm/Ω). Anything else is
/// returned unchanged.
pub fn to_display_units(value: f64, units: &str) -> f64 {
    let units = units.trim();
    let Some(prefix) = ["Ohm", "ohm", "Ω", "Hz", "V", "s"]
        .iter()
        .find_map(|base| units.strip_suffix(base))
    else {
        return value;
    };
    let factor = match prefix {
        "" => 1.0,
        "p" => 1e-12,
        "n" => 1e-9,
        "u" | "µ" | "μ" => 1e-6,
        "m" => 1e-3,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        _ => return value,
    };
    value / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coordinate() {
        assert_eq!(parse_coordinate("J12"), Some((10, 12)));
        assert_eq!(parse_coordinate("$a$1"), Some((1, 1)));
        assert_eq!(parse_coordinate("AA3"), Some((27, 3)));
        assert_eq!(parse_coordinate("12"), None);
        assert_eq!(parse_coordinate("J0"), None);
        assert_eq!(parse_coordinate("J"), None);
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letters(10), "J");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(0), "");
    }

    #[test]
    fn test_cell_value_parse() {
        assert_eq!(CellValue::parse(" "), CellValue::Empty);
        assert_eq!(CellValue::parse("1e-3"), CellValue::Number(0.001));
        assert_eq!(CellValue::parse("EXT"), CellValue::Text("EXT".into()));
        assert_eq!(CellValue::Number(50.0).as_text(), "50");
        assert_eq!(CellValue::Text(" 2.5 ".into()).as_f64(), Some(2.5));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("dcv-bal".parse::<TestKind>().unwrap(), TestKind::DcvBalance);
        assert_eq!(" TIME ".parse::<TestKind>().unwrap(), TestKind::Timebase);
        assert!("SWEEP".parse::<TestKind>().is_err());
        assert!(TestKind::Cursor.supports_parallel_channels());
        assert!(!TestKind::Timebase.supports_parallel_channels());
        let mut sorted = TestKind::ALL;
        sorted.sort();
        assert_eq!(sorted, TestKind::ALL);
    }

    #[test]
    fn test_display_units() {
        assert!((to_display_units(0.0123, "mV") - 12.3).abs() < 1e-9);
        assert!((to_display_units(2.5e-9, "ns") - 2.5).abs() < 1e-9);
        assert!((to_display_units(1.0e-6, "µs") - 1.0).abs() < 1e-9);
        assert!((to_display_units(1.002e6, "MOhm") - 1.002).abs() < 1e-9);
        assert!((to_display_units(50.1, "Ω") - 50.1).abs() < 1e-9);
        assert_eq!(to_display_units(3.0, "ppm"), 3.0);
        assert_eq!(to_display_units(3.0, ""), 3.0);
    }
}
