//! Daily attendance ledger: one spreadsheet per calendar date.
//!
//! Files are `Attendance_YYYY-MM-DD.xlsx` with a `Name` / `Timestamp` header.
//! Each file is read once per run into an in-memory index; every new row
//! rewrites the whole sheet through a temporary file and a rename.

use calamine::{open_workbook, Reader, Xlsx};
use chrono::{NaiveDate, NaiveDateTime};
use rust_xlsxwriter::{Format, Workbook};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SHEET_NAME: &str = "Attendance";
const NAME_HEADER: &str = "Name";
const TIME_HEADER: &str = "Timestamp";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to create reports directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        source: calamine::XlsxError,
    },
    #[error("ledger {path} has no worksheet")]
    NoSheet { path: PathBuf },
    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        source: rust_xlsxwriter::XlsxError,
    },
    #[error("failed to move ledger into place at {path}: {source}")]
    Replace {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One row of a daily ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub name: String,
    /// Time of first sighting, `HH:MM:SS`.
    pub time: String,
}

/// Outcome of [`Ledger::record_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    New(AttendanceRecord),
    AlreadyPresent,
}

#[derive(Debug, Default)]
struct DaySheet {
    rows: Vec<AttendanceRecord>,
    names: HashSet<String>,
}

impl DaySheet {
    fn from_rows(rows: Vec<AttendanceRecord>) -> Self {
        let names = rows.iter().map(|r| r.name.clone()).collect();
        Self { rows, names }
    }
}

pub struct Ledger {
    dir: PathBuf,
    days: HashMap<NaiveDate, DaySheet>,
}

impl Ledger {
    /// A ledger writing into `dir`. Nothing is touched on disk until the
    /// first read or write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            days: HashMap::new(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(file_name_for(date))
    }

    /// Record `name` as present at `at`, unless they already have a row for
    /// that date (in this run or a previous one). A failed write leaves the
    /// ledger as it was, so the next sighting tries again.
    pub fn record_if_absent(
        &mut self,
        name: &str,
        at: NaiveDateTime,
    ) -> Result<Recorded, LedgerError> {
        let date = at.date();
        let path = self.path_for(date);
        let dir = self.dir.clone();
        let day = self.day(date)?;

        if day.names.contains(name) {
            return Ok(Recorded::AlreadyPresent);
        }

        let record = AttendanceRecord {
            name: name.to_string(),
            time: at.format(TIME_FORMAT).to_string(),
        };

        let mut rows = day.rows.clone();
        rows.push(record.clone());
        std::fs::create_dir_all(&dir).map_err(|source| LedgerError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        write_sheet(&path, &rows)?;

        day.rows = rows;
        day.names.insert(record.name.clone());
        tracing::info!(name, time = %record.time, path = %path.display(), "attendance recorded");
        Ok(Recorded::New(record))
    }

    /// All rows for `date`, in the order they were recorded.
    pub fn entries(&mut self, date: NaiveDate) -> Result<&[AttendanceRecord], LedgerError> {
        Ok(&self.day(date)?.rows)
    }

    fn day(&mut self, date: NaiveDate) -> Result<&mut DaySheet, LedgerError> {
        if !self.days.contains_key(&date) {
            let rows = read_sheet(&self.path_for(date))?;
            tracing::debug!(%date, rows = rows.len(), "loaded ledger");
            self.days.insert(date, DaySheet::from_rows(rows));
        }
        Ok(self.days.entry(date).or_default())
    }
}

pub fn file_name_for(date: NaiveDate) -> String {
    format!("Attendance_{}.xlsx", date.format("%Y-%m-%d"))
}

/// Read a ledger file; a missing file is an empty ledger.
fn read_sheet(path: &Path) -> Result<Vec<AttendanceRecord>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let read_err = |source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook: Xlsx<_> = open_workbook(path).map_err(read_err)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| LedgerError::NoSheet {
            path: path.to_path_buf(),
        })?
        .map_err(read_err)?;

    let mut rows = Vec::new();
    for (i, row) in range.rows().enumerate() {
        let cell = |col: usize| row.get(col).map(|c| c.to_string()).unwrap_or_default();
        // Names are compared exactly as written.
        let name = cell(0);
        if name.is_empty() || (i == 0 && name == NAME_HEADER) {
            continue;
        }
        rows.push(AttendanceRecord {
            name,
            time: cell(1),
        });
    }
    Ok(rows)
}

/// Write the full sheet to a sibling temp file, then rename over `path`.
fn write_sheet(path: &Path, rows: &[AttendanceRecord]) -> Result<(), LedgerError> {
    let write_err = |source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME).map_err(write_err)?;
    sheet.set_column_width(0, 28).map_err(write_err)?;
    sheet.set_column_width(1, 12).map_err(write_err)?;
    sheet
        .write_string_with_format(0, 0, NAME_HEADER, &header)
        .map_err(write_err)?;
    sheet
        .write_string_with_format(0, 1, TIME_HEADER, &header)
        .map_err(write_err)?;
    for (i, record) in rows.iter().enumerate() {
        let row = i as u32 + 1;
        sheet.write_string(row, 0, &record.name).map_err(write_err)?;
        sheet.write_string(row, 1, &record.time).map_err(write_err)?;
    }

    let tmp = path.with_extension("xlsx.tmp");
    workbook.save(&tmp).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp);
        LedgerError::Replace {
            path: path.to_path_buf(),
            source,
        }
    })
}
