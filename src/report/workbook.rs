//! Spreadsheet codec
//!
//! Reads requisition workbooks with calamine and writes the annotated copy
//! with rust_xlsxwriter. The copy carries the original sheets' values (not
//! their styling) followed by the follow-up sheets and the report sheet.

use super::{FollowUpEntry, ReportRecord};
use crate::config::WorkbookSection;
use crate::ingest::{collect_rows, CellValue, RawRow};
use calamine::{open_workbook, Data, Reader, Xlsx};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, Worksheet, XlsxError};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const REPORT_SHEET: &str = "Report";
pub const NOT_FOUND_SHEET: &str = "Not found";
pub const DUPLICATES_SHEET: &str = "Duplicates";

pub const REPORT_HEADER: [&str; 10] = [
    "Visit date",
    "Requisition no.",
    "Full name",
    "Birth date",
    "Test code",
    "Test name",
    "Quantity",
    "Price",
    "Payment type",
    "Comment",
];
const FOLLOW_UP_HEADER: [&str; 4] = ["Visit date", "Requisition no.", "Full name", "Birth date"];

const FLAGGED_FILL: u32 = 0xFFC7CE;
const PRICE_FORMAT: &str = "0.00";
const DATE_FORMAT: &str = "dd.mm.yyyy";
const QUANTITY_COLUMN: u16 = 6;
const PRICE_COLUMN: u16 = 7;
const CENTERED_COLUMNS: [u16; 3] = [0, 1, 3];
const WIDTH_PADDING: usize = 4;

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("Failed to open workbook {path}: {message}")]
    Open { path: String, message: String },

    #[error("Workbook {0} has no sheets")]
    NoSheets(String),

    #[error("Failed to write report: {0}")]
    Write(#[from] XlsxError),
}

/// Cell values of one source sheet, keyed by 0-based (row, column)
#[derive(Debug, Clone, Default)]
pub struct SourceSheet {
    pub name: String,
    cells: BTreeMap<(u32, u32), CellValue>,
}

impl SourceSheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, row: u32, col: u32, value: CellValue) {
        self.cells.insert((row, col), value);
    }

    pub fn get(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells.get(&(row, col))
    }

    fn last_row(&self) -> Option<u32> {
        self.cells.keys().map(|(row, _)| *row).max()
    }

    /// Lines of the configured column window, from the configured start row
    pub fn lines(&self, layout: &WorkbookSection) -> Vec<Vec<Option<CellValue>>> {
        let first_row = layout.start_row.saturating_sub(1);
        let Some(last_row) = self.last_row() else {
            return Vec::new();
        };
        let columns = layout.min_col.saturating_sub(1)..layout.max_col;

        (first_row..=last_row)
            .map(|row| {
                columns
                    .clone()
                    .map(|col| self.get(row, col).cloned())
                    .collect()
            })
            .collect()
    }
}

/// All sheets of an uploaded workbook, in workbook order
#[derive(Debug, Clone, Default)]
pub struct SourceWorkbook {
    pub sheets: Vec<SourceSheet>,
}

impl SourceWorkbook {
    pub fn open(path: &Path) -> Result<Self, WorkbookError> {
        let open_error = |message: String| WorkbookError::Open {
            path: path.display().to_string(),
            message,
        };

        let mut workbook: Xlsx<_> = open_workbook(path).map_err(|e: calamine::XlsxError| open_error(e.to_string()))?;

        let mut sheets = Vec::new();
        for (name, range) in workbook.worksheets() {
            let (row0, col0) = range.start().unwrap_or((0, 0));
            let mut sheet = SourceSheet::new(name);
            for (row, col, data) in range.used_cells() {
                if let Some(value) = cell_value(data) {
                    sheet.set(row0 + row as u32, col0 + col as u32, value);
                }
            }
            sheets.push(sheet);
        }

        if sheets.is_empty() {
            return Err(WorkbookError::NoSheets(path.display().to_string()));
        }
        debug!("Loaded {} sheets from {}", sheets.len(), path.display());
        Ok(Self { sheets })
    }
}

fn cell_value(data: &Data) -> Option<CellValue> {
    match data {
        Data::Int(i) => Some(CellValue::Integer(*i)),
        Data::Float(f) => Some(CellValue::Float(*f)),
        Data::String(s) => Some(CellValue::Text(s.clone())),
        Data::Bool(b) => Some(CellValue::Bool(*b)),
        Data::DateTime(dt) => dt.as_datetime().map(|at| {
            if at.time() == chrono::NaiveTime::MIN {
                CellValue::Date(at.date())
            } else {
                CellValue::DateTime(at)
            }
        }),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(CellValue::Text(s.clone())),
        Data::Error(_) | Data::Empty => None,
    }
}

/// Requisition lines of the active (first) sheet
pub fn read_requisitions(
    workbook: &SourceWorkbook,
    layout: &WorkbookSection,
) -> Result<Vec<RawRow>, WorkbookError> {
    let sheet = workbook
        .sheets
        .first()
        .ok_or_else(|| WorkbookError::NoSheets("uploaded workbook".to_string()))?;

    let rows = collect_rows(sheet.lines(layout), layout.start_row as usize);
    info!("Read {} requisition lines from sheet {}", rows.len(), sheet.name);
    Ok(rows)
}

/// Everything appended to the copy of the source workbook
#[derive(Debug, Clone, Default)]
pub struct ReportContent<'a> {
    pub records: &'a [ReportRecord],
    pub not_found: &'a [FollowUpEntry],
    pub duplicates: &'a [FollowUpEntry],
}

/// Write the annotated workbook to `path`
pub fn write_report(
    path: &Path,
    source: &SourceWorkbook,
    content: &ReportContent<'_>,
) -> Result<(), WorkbookError> {
    let mut workbook = Workbook::new();
    let generated = [REPORT_SHEET, NOT_FOUND_SHEET, DUPLICATES_SHEET];

    for sheet in source
        .sheets
        .iter()
        .filter(|s| !generated.contains(&s.name.as_str()))
    {
        copy_sheet(workbook.add_worksheet(), sheet)?;
    }

    if !content.not_found.is_empty() {
        write_follow_up(workbook.add_worksheet(), NOT_FOUND_SHEET, content.not_found)?;
    }
    if !content.duplicates.is_empty() {
        write_follow_up(workbook.add_worksheet(), DUPLICATES_SHEET, content.duplicates)?;
    }
    write_records(workbook.add_worksheet(), content.records)?;

    workbook.save(path)?;
    info!(
        "Wrote report with {} records to {}",
        content.records.len(),
        path.display()
    );
    Ok(())
}

fn copy_sheet(worksheet: &mut Worksheet, sheet: &SourceSheet) -> Result<(), XlsxError> {
    worksheet.set_name(&sheet.name)?;
    let date_format = Format::new().set_num_format(DATE_FORMAT);

    for (&(row, col), value) in &sheet.cells {
        let Ok(col) = u16::try_from(col) else {
            continue;
        };
        match value {
            CellValue::Text(s) => worksheet.write_string(row, col, s)?,
            CellValue::Integer(i) => worksheet.write_number(row, col, *i as f64)?,
            CellValue::Float(f) => worksheet.write_number(row, col, *f)?,
            CellValue::Bool(b) => worksheet.write_boolean(row, col, *b)?,
            CellValue::Date(d) => worksheet.write_datetime_with_format(row, col, d, &date_format)?,
            CellValue::DateTime(dt) => {
                worksheet.write_datetime_with_format(row, col, dt, &date_format)?
            }
        };
    }
    Ok(())
}

fn write_follow_up(
    worksheet: &mut Worksheet,
    name: &str,
    entries: &[FollowUpEntry],
) -> Result<(), XlsxError> {
    worksheet.set_name(name)?;

    let lines: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.visit_date.clone(),
                e.requisition_number.clone(),
                e.full_name.clone(),
                e.birth_day.clone(),
            ]
        })
        .collect();

    write_header(worksheet, &FOLLOW_UP_HEADER)?;
    for (i, line) in lines.iter().enumerate() {
        let row = i as u32 + 1;
        for (col, value) in line.iter().enumerate() {
            let col = col as u16;
            worksheet.write_string_with_format(row, col, value, &cell_format(col, false))?;
        }
    }

    let widths = column_widths(&FOLLOW_UP_HEADER, lines.iter().map(|l| l.as_slice()));
    set_widths(worksheet, &widths)
}

fn write_records(worksheet: &mut Worksheet, records: &[ReportRecord]) -> Result<(), XlsxError> {
    worksheet.set_name(REPORT_SHEET)?;
    write_header(worksheet, &REPORT_HEADER)?;

    let mut texts = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let row = i as u32 + 1;
        let flagged = record.is_flagged();
        let line = [
            record.visit_date.clone(),
            record.requisition_number.clone(),
            record.full_name.clone(),
            record.birth_day.clone(),
            record.test_code.clone(),
            record.test_name.clone(),
            record.quantity.to_string(),
            format!("{:.2}", record.price),
            record.pay_type.clone(),
            record.comment.clone(),
        ];

        for (col, value) in line.iter().enumerate() {
            let col = col as u16;
            let format = cell_format(col, flagged);
            match col {
                QUANTITY_COLUMN => {
                    worksheet.write_number_with_format(row, col, record.quantity, &format)?
                }
                PRICE_COLUMN => {
                    worksheet.write_number_with_format(row, col, record.price, &format)?
                }
                _ => worksheet.write_string_with_format(row, col, value, &format)?,
            };
        }
        texts.push(line.to_vec());
    }

    let widths = column_widths(&REPORT_HEADER, texts.iter().map(|l| l.as_slice()));
    set_widths(worksheet, &widths)
}

fn write_header(worksheet: &mut Worksheet, header: &[&str]) -> Result<(), XlsxError> {
    let format = Format::new().set_bold().set_align(FormatAlign::Center);
    for (col, title) in header.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &format)?;
    }
    Ok(())
}

fn cell_format(col: u16, flagged: bool) -> Format {
    let mut format = Format::new();
    if CENTERED_COLUMNS.contains(&col) {
        format = format.set_align(FormatAlign::Center);
    }
    if col == PRICE_COLUMN {
        format = format.set_num_format(PRICE_FORMAT);
    }
    if flagged {
        format = format.set_background_color(Color::RGB(FLAGGED_FILL));
    }
    format
}

/// Longest value per column plus padding, header included (pure)
fn column_widths<'a>(header: &[&str], lines: impl Iterator<Item = &'a [String]>) -> Vec<usize> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for line in lines {
        for (col, value) in line.iter().enumerate() {
            if let Some(width) = widths.get_mut(col) {
                *width = (*width).max(value.chars().count());
            }
        }
    }
    widths.into_iter().map(|w| w + WIDTH_PADDING).collect()
}

fn set_widths(worksheet: &mut Worksheet, widths: &[usize]) -> Result<(), XlsxError> {
    for (col, width) in widths.iter().enumerate() {
        worksheet.set_column_width(col as u16, *width as f64)?;
    }
    Ok(())
}
