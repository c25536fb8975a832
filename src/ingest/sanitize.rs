//! Raw line to typed [`Row`] conversion

use super::{CellValue, IngestError, RawRow};
use crate::model::{Person, Row, SourceTest};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};

/// Data cells per line: requisition no., full name, test code, test name, quantity, price
pub const DATA_CELLS: usize = 6;

const DAY_FIRST_DATE_FORMATS: &[&str] = &[
    "%d.%m.%y", "%d.%m.%Y", "%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%Y%m%d",
];
const DAY_FIRST_DATETIME_FORMATS: &[&str] = &[
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Sanitize every collected line, failing on the first malformed one
pub fn sanitize_rows(raw: &[RawRow]) -> Result<Vec<Row>, IngestError> {
    let today = Local::now().date_naive();
    raw.iter().map(|row| sanitize_row(row, today)).collect()
}

/// Convert one raw line; `today` anchors the two-digit-year pivot
pub fn sanitize_row(raw: &RawRow, today: NaiveDate) -> Result<Row, IngestError> {
    let [inz, full_name, code, name, quantity, price] = raw.cells.as_slice() else {
        return Err(IngestError::CellCount {
            line: raw.line,
            expected: DATA_CELLS,
            found: raw.cells.len(),
        });
    };

    let birth_day =
        normalize_birthday(&raw.birthday, today).ok_or_else(|| IngestError::Birthday {
            line: raw.line,
            value: raw.birthday.clone(),
        })?;
    let [last_name, first_name, middle_name] = split_name(&full_name.to_string());

    Ok(Row {
        position: raw.position,
        visit_date: raw.visit_date.clone(),
        requisition_number: inz.to_string(),
        person: Person {
            last_name,
            first_name,
            middle_name,
            birth_day,
        },
        test_src: SourceTest {
            code: code.to_string(),
            name: name.to_string(),
            quantity: parse_quantity(quantity).ok_or_else(|| IngestError::InvalidField {
                line: raw.line,
                field: "quantity",
                value: quantity.to_string(),
            })?,
            price: parse_price(price).ok_or_else(|| IngestError::InvalidField {
                line: raw.line,
                field: "price",
                value: price.to_string(),
            })?,
        },
    })
}

/// Split a full name into last, first and middle parts
///
/// Words are title-cased. Anything past the third word belongs to the middle
/// name (patronymic suffixes like "Ogly"); missing parts are empty.
pub fn split_name(raw: &str) -> [String; 3] {
    let titled = title_case(raw);
    let mut words = titled.split_whitespace();
    let last = words.next().unwrap_or_default().to_string();
    let first = words.next().unwrap_or_default().to_string();
    let middle = words.collect::<Vec<_>>().join(" ");
    [last, first, middle]
}

fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut after_letter = false;
    for c in raw.chars() {
        if c.is_alphabetic() {
            if after_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            after_letter = true;
        } else {
            out.push(c);
            after_letter = false;
        }
    }
    out
}

/// Normalize a birthdate to `DD.MM.YYYY`
///
/// Values starting with six digits are read as `DDMMYY`, with two-digit years
/// above the current one placed in the previous century. Other values go
/// through common day-first formats.
pub fn normalize_birthday(raw: &str, today: NaiveDate) -> Option<String> {
    let raw = raw.trim();
    compact_birthday(raw, today)
        .or_else(|| parse_day_first(raw))
        .map(|date| date.format("%d.%m.%Y").to_string())
}

fn compact_birthday(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let digits: String = raw.chars().take(6).collect();
    if digits.chars().count() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let day: u32 = digits[0..2].parse().ok()?;
    let month: u32 = digits[2..4].parse().ok()?;
    let yy: i32 = digits[4..6].parse().ok()?;

    let century = today.year() / 100 * 100;
    let year = if yy > today.year() % 100 {
        century - 100 + yy
    } else {
        century + yy
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_day_first(raw: &str) -> Option<NaiveDate> {
    DAY_FIRST_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DAY_FIRST_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn parse_quantity(cell: &CellValue) -> Option<u32> {
    match cell {
        CellValue::Integer(i) => u32::try_from(*i).ok(),
        CellValue::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX) => {
            Some(*f as u32)
        }
        CellValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_price(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Integer(i) => Some(*i as f64),
        CellValue::Float(f) if f.is_finite() => Some(*f),
        CellValue::Text(s) => s
            .trim()
            .replace(char::is_whitespace, "")
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite()),
        _ => None,
    }
}
