//! Requisition sheet ingestion
//!
//! The sheet interleaves context lines with data lines: a line with one
//! populated cell carries the visit date, a line with two carries the
//! patient's birthdate, and longer lines are tests for the current patient.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub mod sanitize;

pub use sanitize::{normalize_birthday, sanitize_row, sanitize_rows, split_name};

/// Typed spreadsheet cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl CellValue {
    /// Blank text counts as an empty cell
    pub fn is_blank(&self) -> bool {
        matches!(self, CellValue::Text(s) if s.trim().is_empty())
    }

    /// Calendar date carried by the cell, if it is a date cell
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    /// Context value as stored on rows: dates become `DD.MM.YYYY`
    pub fn to_context_string(&self) -> String {
        match self.as_date() {
            Some(date) => date.format("%d.%m.%Y").to_string(),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s.trim()),
            CellValue::Integer(i) => write!(f, "{i}"),
            CellValue::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Bool(b) => write!(f, "{b}"),
            CellValue::Date(d) => write!(f, "{}", d.format("%d.%m.%Y")),
            CellValue::DateTime(dt) => write!(f, "{}", dt.format("%d.%m.%Y %H:%M:%S")),
        }
    }
}

/// Data line combined with its visit-date and birthdate context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRow {
    /// Ordinal among accepted data lines
    pub position: usize,
    /// 1-based sheet line the data came from
    pub line: usize,
    pub visit_date: String,
    pub birthday: String,
    pub cells: Vec<CellValue>,
}

impl RawRow {
    fn identity(&self) -> Vec<String> {
        let mut key = vec![self.visit_date.clone(), self.birthday.clone()];
        key.extend(self.cells.iter().map(ToString::to_string));
        key
    }
}

/// Raw line to typed row failures
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Line {line}: expected {expected} data cells, found {found}")]
    CellCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Line {line}: unrecognized birth date '{value}'")]
    Birthday { line: usize, value: String },

    #[error("Line {line}: invalid {field} '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Apply the context-line rules to sheet lines starting at `first_line`
///
/// Each input line is the configured column window with `None` for empty
/// cells. Collection stops at the first line without any populated cell;
/// repeated data lines (same context and values) are dropped.
pub fn collect_rows<I>(lines: I, first_line: usize) -> Vec<RawRow>
where
    I: IntoIterator<Item = Vec<Option<CellValue>>>,
{
    let mut visit_date: Option<String> = None;
    let mut birthday: Option<String> = None;
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut rows = Vec::new();

    for (offset, line) in lines.into_iter().enumerate() {
        let line_no = first_line + offset;
        let cells: Vec<CellValue> = line
            .into_iter()
            .flatten()
            .filter(|cell| !cell.is_blank())
            .collect();

        match cells.len() {
            0 => {
                debug!("Stopping ingestion at empty line {}", line_no);
                break;
            }
            1 => visit_date = Some(cells[0].to_context_string()),
            2 => birthday = Some(cells[0].to_context_string()),
            _ => {
                let (Some(visit), Some(birth)) = (&visit_date, &birthday) else {
                    debug!("Skipping line {} without visit/birthdate context", line_no);
                    continue;
                };
                let row = RawRow {
                    position: rows.len(),
                    line: line_no,
                    visit_date: visit.clone(),
                    birthday: birth.clone(),
                    cells,
                };
                if seen.insert(row.identity()) {
                    rows.push(row);
                } else {
                    debug!("Dropping duplicate line {}", line_no);
                }
            }
        }
    }

    rows
}
