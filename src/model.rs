//! Row types flowing through the enrichment pipeline
//!
//! A requisition line starts as a [`Row`] and evolves through one type per
//! stage, so the fields available after each stage are fixed by the type:
//!
//! ```text
//! Row -> IdentifiedRow -> ValidRow -> CatalogedRow -> HistoriedRow -> PricedRow -> EnrichedRow
//! ```
//!
//! Only [`ValidRow::try_from_identified`] can admit a row past identity
//! resolution, which keeps sentinel identities out of the later lookups.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Patient identity as written on the requisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub last_name: String,
    pub first_name: String,
    pub middle_name: String,
    /// Normalized to `DD.MM.YYYY`
    pub birth_day: String,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {} {}", self.last_name, self.first_name, self.middle_name)
            .trim()
            .to_string()
    }
}

/// Test as declared in the source spreadsheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTest {
    pub code: String,
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

/// One sanitized requisition line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Ordinal of the line in the ingested sheet, used to restore report order
    pub position: usize,
    /// Visit date as `DD.MM.YYYY`
    pub visit_date: String,
    pub requisition_number: String,
    pub person: Person,
    pub test_src: SourceTest,
}

/// Outcome of identity resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersonId {
    /// Registry identifier of the single match
    Found(String),
    NotFound,
    MultipleFound,
    ApiError,
}

impl PersonId {
    /// Wrap a registry identifier; blank identifiers are treated as a lookup error
    pub fn from_registry(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.trim().is_empty() {
            PersonId::ApiError
        } else {
            PersonId::Found(id)
        }
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonId::Found(id) => write!(f, "{id}"),
            PersonId::NotFound => write!(f, "NOT_FOUND"),
            PersonId::MultipleFound => write!(f, "MULTIPLE_FOUND"),
            PersonId::ApiError => write!(f, "API_ERROR"),
        }
    }
}

/// Row after identity resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedRow {
    pub row: Row,
    pub person_id: PersonId,
}

/// Row whose person resolved to a genuine registry identifier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidRow {
    row: Row,
    person_id: String,
}

impl ValidRow {
    /// Admit a row with a real registry identifier; sentinel rows are handed back
    pub fn try_from_identified(identified: IdentifiedRow) -> Result<Self, IdentifiedRow> {
        match identified.person_id {
            PersonId::Found(id) => Ok(Self {
                row: identified.row,
                person_id: id,
            }),
            _ => Err(identified),
        }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn person_id(&self) -> &str {
        &self.person_id
    }

    pub fn with_service(self, test_registry: Option<RegistryTest>) -> CatalogedRow {
        CatalogedRow {
            row: self.row,
            person_id: self.person_id,
            test_registry,
        }
    }
}

/// Catalog entry matched exactly by test code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTest {
    pub id: String,
    pub code: String,
    pub name: String,
}

/// Row after service metadata lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogedRow {
    pub row: Row,
    pub person_id: String,
    pub test_registry: Option<RegistryTest>,
}

impl CatalogedRow {
    pub fn with_history(self, tests_history: Vec<HistoryItem>) -> HistoriedRow {
        HistoriedRow {
            row: self.row,
            person_id: self.person_id,
            test_registry: self.test_registry,
            tests_history,
        }
    }
}

/// Laboratory event from the person's service history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub event_id: Option<String>,
    pub med_personal_id: Option<String>,
    pub date: Option<String>,
    pub test_name: Option<String>,
    pub tests_group_name: Option<String>,
    pub test_id: Option<String>,
    /// Event timestamp as `YYYY-MM-DD HH:MM:SS`
    pub sort: Option<String>,
}

/// Row after test-history lookup (and narrowing)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoriedRow {
    pub row: Row,
    pub person_id: String,
    pub test_registry: Option<RegistryTest>,
    pub tests_history: Vec<HistoryItem>,
}

impl HistoriedRow {
    pub fn with_report(self, test_report: Option<TestReport>) -> PricedRow {
        PricedRow {
            row: self.row,
            person_id: self.person_id,
            test_registry: self.test_registry,
            tests_history: self.tests_history,
            test_report,
        }
    }
}

/// Which path produced the payment classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    TestReport,
    MedicalHistory,
}

/// Resolved payment classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub pay_type_id: String,
    pub pay_type_label: String,
    pub staff_id: Option<String>,
    pub direction_id: Option<String>,
    pub source: PaymentSource,
}

/// Row after primary payment-type resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedRow {
    pub row: Row,
    pub person_id: String,
    pub test_registry: Option<RegistryTest>,
    pub tests_history: Vec<HistoryItem>,
    pub test_report: Option<TestReport>,
}

impl PricedRow {
    pub fn needs_fallback(&self) -> bool {
        self.test_report.is_none()
    }

    /// Finish the row without consulting the medical history
    pub fn resolved(self) -> EnrichedRow {
        self.with_fallback(Vec::new(), None)
    }

    /// Finish the row with the fallback result; a primary classification always wins
    pub fn with_fallback(
        self,
        medical_history: Vec<MedicalEvent>,
        fallback_report: Option<TestReport>,
    ) -> EnrichedRow {
        EnrichedRow {
            row: self.row,
            person_id: self.person_id,
            test_registry: self.test_registry,
            tests_history: self.tests_history,
            test_report: self.test_report.or(fallback_report),
            medical_history,
        }
    }
}

/// General medical event inside the visit window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalEvent {
    pub date_set: String,
    pub date_dis: Option<String>,
    pub med_personal_id: Option<String>,
    pub evn_class_name: Option<String>,
    pub diag_code: Option<String>,
    pub diag_name: Option<String>,
    pub evn_type: String,
    pub children_evn_id: Option<String>,
    pub med_staff_fact_id: Option<String>,
}

/// Fully enriched row, ready for the report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRow {
    pub row: Row,
    pub person_id: String,
    pub test_registry: Option<RegistryTest>,
    pub tests_history: Vec<HistoryItem>,
    pub test_report: Option<TestReport>,
    pub medical_history: Vec<MedicalEvent>,
}
