//! Outcome of a calibration run.
//!
//! One [`RowOutcome`] is recorded per requested row, in the order the rows
//! were processed. The summary serialises to JSON for archiving next to the
//! workbook.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowStatus {
    /// Measured and written to the workbook.
    Tested { result: String },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub row: u32,
    pub function: String,
    #[serde(flatten)]
    pub status: RowStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started: DateTime<Local>,
    pub finished: Option<DateTime<Local>>,
    /// The operator stopped the run before every row was processed.
    pub aborted: bool,
    pub rows: Vec<RowOutcome>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            started: Local::now(),
            finished: None,
            aborted: false,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: u32, function: impl Into<String>, status: RowStatus) {
        self.rows.push(RowOutcome {
            row,
            function: function.into(),
            status,
        });
    }

    pub fn contains(&self, row: u32) -> bool {
        self.rows.iter().any(|outcome| outcome.row == row)
    }

    pub fn outcome(&self, row: u32) -> Option<&RowOutcome> {
        self.rows.iter().find(|outcome| outcome.row == row)
    }

    pub fn tested(&self) -> usize {
        self.count(|s| matches!(s, RowStatus::Tested { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RowStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RowStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&RowStatus) -> bool) -> usize {
        self.rows.iter().filter(|outcome| pred(&outcome.status)).count()
    }

    pub(crate) fn finish(&mut self) {
        self.finished = Some(Local::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_lookup() {
        let mut summary = RunSummary::new();
        summary.push(12, "DCV", RowStatus::Tested { result: "12.3".into() });
        summary.push(13, "CURS", RowStatus::Skipped { reason: "no reading".into() });
        summary.push(14, "TIME", RowStatus::Failed { error: "timeout".into() });
        summary.push(15, "DCV", RowStatus::Tested { result: "1.0".into() });
        assert_eq!(summary.tested(), 2);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.failed(), 1);
        assert!(summary.contains(14));
        assert_eq!(summary.outcome(13).unwrap().function, "CURS");
        assert!(summary.outcome(99).is_none());
    }

    #[test]
    fn test_json_shape() {
        let mut summary = RunSummary::new();
        summary.push(18, "TRIG", RowStatus::Tested { result: "Pass".into() });
        summary.finish();
        let json = serde_json::to_value(&summary).unwrap();
        let row = &json["rows"][0];
        assert_eq!(row["row"], 18);
        assert_eq!(row["status"], "tested");
        assert_eq!(row["result"], "Pass");
        assert_eq!(json["aborted"], false);
        assert!(json["finished"].is_string());
    }
}
