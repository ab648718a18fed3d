//! CSV-backed sheet.
//!
//! Row `n` of the file is workbook row `n`; there is no header record.
//! Named ranges are not part of CSV, so they come from configuration.

use super::{parse_coordinate, CellValue, Sheet};
use crate::error::{AppResult, CalError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub struct CsvSheet {
    path: PathBuf,
    rows: Vec<Vec<CellValue>>,
    names: HashMap<String, (u32, u32)>,
    backup_dir: PathBuf,
    dirty: bool,
}

impl CsvSheet {
    /// Load `path`. Every record may have a different number of fields.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(CellValue::parse).collect());
        }
        info!("Loaded {} rows from '{}'", rows.len(), path.display());
        Ok(Self {
            path,
            rows,
            names: HashMap::new(),
            backup_dir: PathBuf::from("Backups"),
            dirty: false,
        })
    }

    /// Named ranges as `name -> A1 reference`.
    pub fn with_names(mut self, names: &HashMap<String, String>) -> AppResult<Self> {
        for (name, reference) in names {
            let coord = parse_coordinate(reference).ok_or_else(|| {
                CalError::Workbook(format!("Named range '{}' has invalid reference '{}'", name, reference))
            })?;
            self.names.insert(name.clone(), coord);
        }
        Ok(self)
    }

    /// Backup directory, relative to the workbook's directory unless absolute.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn write_to(&self, path: &Path) -> AppResult<()> {
        let width = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        for row in &self.rows {
            let mut record: Vec<String> = row.iter().map(CellValue::as_text).collect();
            record.resize(width, String::new());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Sheet for CsvSheet {
    fn cell(&self, col: u32, row: u32) -> CellValue {
        if col == 0 || row == 0 {
            return CellValue::Empty;
        }
        self.rows
            .get(row as usize - 1)
            .and_then(|r| r.get(col as usize - 1))
            .cloned()
            .unwrap_or_default()
    }

    fn set_cell(&mut self, col: u32, row: u32, value: CellValue) {
        if col == 0 || row == 0 {
            return;
        }
        let (r, c) = (row as usize - 1, col as usize - 1);
        if self.rows.len() <= r {
            self.rows.resize_with(r + 1, Vec::new);
        }
        let cells = &mut self.rows[r];
        if cells.len() <= c {
            cells.resize(c + 1, CellValue::Empty);
        }
        cells[c] = value;
        self.dirty = true;
    }

    fn defined_name(&self, name: &str) -> Option<(u32, u32)> {
        self.names.get(name).copied()
    }

    /// Write the file, retrying once after a second (the file may be briefly
    /// locked by a viewer).
    fn save(&mut self) -> AppResult<()> {
        if let Err(first) = self.write_to(&self.path) {
            warn!("Saving '{}' failed, retrying: {}", self.path.display(), first);
            std::thread::sleep(Duration::from_secs(1));
            self.write_to(&self.path)?;
        }
        self.dirty = false;
        Ok(())
    }

    fn backup(&self) -> AppResult<Option<PathBuf>> {
        let dir = match self.path.parent() {
            Some(parent) if self.backup_dir.is_relative() => parent.join(&self.backup_dir),
            _ => self.backup_dir.clone(),
        };
        fs::create_dir_all(&dir)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workbook.csv".to_string());
        let target = dir.join(format!(
            "{}_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            file_name
        ));
        self.write_to(&target)?;
        info!("Backed up workbook to '{}'", target.display());
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("666_DSOX3034T.csv");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_ragged_rows() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "Title\n,,Result,,Units\n,,,,mV,,DCV,1\n");
        let sheet = CsvSheet::open(&path).unwrap();
        assert_eq!(sheet.cell(1, 1), CellValue::Text("Title".into()));
        assert_eq!(sheet.cell(5, 3), CellValue::Text("mV".into()));
        assert_eq!(sheet.cell(8, 3), CellValue::Number(1.0));
        assert!(sheet.cell(40, 40).is_empty());
    }

    #[test]
    fn test_save_round_trips_written_cells() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a,b\n");
        let mut sheet = CsvSheet::open(&path).unwrap();
        sheet.set_cell(4, 3, CellValue::Number(0.0125));
        assert!(sheet.is_dirty());
        sheet.save().unwrap();
        assert!(!sheet.is_dirty());

        let reloaded = CsvSheet::open(&path).unwrap();
        assert_eq!(reloaded.cell(4, 3), CellValue::Number(0.0125));
        assert_eq!(reloaded.cell(2, 1), CellValue::Text("b".into()));
    }

    #[test]
    fn test_names_from_config() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a\n");
        let mut names = HashMap::new();
        names.insert("StartCell".to_string(), "J12".to_string());
        let sheet = CsvSheet::open(&path).unwrap().with_names(&names).unwrap();
        assert_eq!(sheet.defined_name("StartCell"), Some((10, 12)));

        names.insert("Age".to_string(), "nonsense".to_string());
        let sheet = CsvSheet::open(&path).unwrap();
        assert!(sheet.with_names(&names).is_err());
    }

    #[test]
    fn test_backup_is_timestamped_copy() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "x,y\n");
        let sheet = CsvSheet::open(&path).unwrap();
        let backup = sheet.backup().unwrap().unwrap();
        assert_eq!(backup.parent().unwrap(), dir.path().join("Backups"));
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_666_DSOX3034T.csv"));
        // YYYYmmdd_HHMMSS_
        assert_eq!(name.find("_666"), Some(15));
        assert_eq!(fs::read_to_string(backup).unwrap(), "x,y\n");
    }
}
