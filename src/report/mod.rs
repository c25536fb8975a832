//! Report flattening
//!
//! Turns classified and enriched rows into the flat records the workbook
//! writer emits, with one payment label or review comment per row.

use crate::model::{EnrichedRow, IdentifiedRow, PersonId, RegistryTest, Row, TestReport};
use serde::Serialize;
use std::collections::BTreeSet;

pub mod workbook;

pub use workbook::{read_requisitions, write_report, WorkbookError};

pub const COMMENT_PATIENT_NOT_FOUND: &str = "patient not found in registry";
pub const COMMENT_DUPLICATE_PATIENTS: &str = "multiple matching patients (duplicates)";
pub const COMMENT_LOOKUP_ERROR: &str = "registry lookup error";
pub const COMMENT_NO_RESULTS: &str = "no results found in registry";

pub fn service_not_found_comment(code: &str) -> String {
    format!("service with code '{code}' not found in registry")
}

/// One line of the report sheet, in column order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRecord {
    pub visit_date: String,
    pub requisition_number: String,
    pub full_name: String,
    pub birth_day: String,
    pub test_code: String,
    pub test_name: String,
    pub quantity: u32,
    pub price: f64,
    pub pay_type: String,
    pub comment: String,
}

impl ReportRecord {
    /// Rows with a comment need manual review
    pub fn is_flagged(&self) -> bool {
        !self.comment.is_empty()
    }

    fn new(row: &Row, (pay_type, comment): (String, String)) -> Self {
        Self {
            visit_date: row.visit_date.clone(),
            requisition_number: row.requisition_number.clone(),
            full_name: row.person.full_name(),
            birth_day: row.person.birth_day.clone(),
            test_code: row.test_src.code.clone(),
            test_name: row.test_src.name.clone(),
            quantity: row.test_src.quantity,
            price: row.test_src.price,
            pay_type,
            comment,
        }
    }
}

/// `(pay_type_label, comment)` for a row; the first matching condition wins
pub fn resolve_outcome(
    person_id: &PersonId,
    test_registry: Option<&RegistryTest>,
    test_report: Option<&TestReport>,
    code: &str,
) -> (String, String) {
    let comment = match (person_id, test_registry, test_report) {
        (PersonId::NotFound, _, _) => COMMENT_PATIENT_NOT_FOUND.to_string(),
        (PersonId::MultipleFound, _, _) => COMMENT_DUPLICATE_PATIENTS.to_string(),
        (PersonId::ApiError, _, _) => COMMENT_LOOKUP_ERROR.to_string(),
        (_, None, _) => service_not_found_comment(code),
        (_, _, None) => COMMENT_NO_RESULTS.to_string(),
        (_, Some(_), Some(report)) => return (report.pay_type_label.clone(), String::new()),
    };
    (String::new(), comment)
}

/// Flat records for every classified row, in sheet order
pub fn flatten(excluded: &[IdentifiedRow], enriched: &[EnrichedRow]) -> Vec<ReportRecord> {
    let excluded = excluded.iter().map(|r| {
        let outcome = resolve_outcome(&r.person_id, None, None, &r.row.test_src.code);
        (r.row.position, ReportRecord::new(&r.row, outcome))
    });

    let enriched = enriched.iter().map(|r| {
        let outcome = resolve_outcome(
            &PersonId::Found(r.person_id.clone()),
            r.test_registry.as_ref(),
            r.test_report.as_ref(),
            &r.row.test_src.code,
        );
        (r.row.position, ReportRecord::new(&r.row, outcome))
    });

    let mut records: Vec<(usize, ReportRecord)> = excluded.chain(enriched).collect();
    records.sort_by_key(|(position, _)| *position);
    records.into_iter().map(|(_, record)| record).collect()
}

/// Line of the "Not found" / "Duplicates" follow-up sheets
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FollowUpEntry {
    pub visit_date: String,
    pub requisition_number: String,
    pub full_name: String,
    pub birth_day: String,
}

/// Unique, sorted follow-up entries for a group of excluded rows
pub fn follow_up_entries(rows: &[IdentifiedRow]) -> Vec<FollowUpEntry> {
    rows.iter()
        .map(|r| FollowUpEntry {
            visit_date: r.row.visit_date.clone(),
            requisition_number: r.row.requisition_number.clone(),
            full_name: r.row.person.full_name(),
            birth_day: r.row.person.birth_day.clone(),
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
