//! In-memory sheet.

use super::{parse_coordinate, CellValue, Sheet};
use crate::error::AppResult;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct MemorySheet {
    cells: HashMap<(u32, u32), CellValue>,
    names: HashMap<String, (u32, u32)>,
    saves: usize,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill consecutive cells of `row` starting at `col`. Blank strings leave
    /// the cell empty, numeric strings become numbers.
    pub fn set_row(&mut self, row: u32, col: u32, values: &[&str]) {
        for (offset, raw) in values.iter().enumerate() {
            self.set_cell(col + offset as u32, row, CellValue::parse(raw));
        }
    }

    /// Define a named range at an A1 reference. Invalid references are ignored.
    pub fn define_name(&mut self, name: &str, reference: &str) {
        if let Some(coord) = parse_coordinate(reference) {
            self.names.insert(name.to_string(), coord);
        }
    }

    /// Number of times [`Sheet::save`] has been called.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl Sheet for MemorySheet {
    fn cell(&self, col: u32, row: u32) -> CellValue {
        self.cells.get(&(col, row)).cloned().unwrap_or_default()
    }

    fn set_cell(&mut self, col: u32, row: u32, value: CellValue) {
        if value == CellValue::Empty {
            self.cells.remove(&(col, row));
        } else {
            self.cells.insert((col, row), value);
        }
    }

    fn defined_name(&self, name: &str) -> Option<(u32, u32)> {
        self.names.get(name).copied()
    }

    fn save(&mut self) -> AppResult<()> {
        self.saves += 1;
        Ok(())
    }

    fn backup(&self) -> AppResult<Option<PathBuf>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_row_and_names() {
        let mut sheet = MemorySheet::new();
        sheet.set_row(12, 10, &["DCV", "1", "", "0.5"]);
        sheet.define_name("StartCell", "J12");
        assert_eq!(sheet.cell(10, 12), CellValue::Text("DCV".into()));
        assert_eq!(sheet.cell(11, 12), CellValue::Number(1.0));
        assert!(sheet.cell(12, 12).is_empty());
        assert_eq!(sheet.defined_name("StartCell"), Some((10, 12)));
        assert_eq!(sheet.defined_name("Age"), None);
    }
}
