//! Row classification after identity resolution

use crate::model::{IdentifiedRow, PersonId, ValidRow};
use tracing::info;

/// Disjoint split of identified rows
#[derive(Debug, Default)]
pub struct Classification {
    /// Rows with a registry identifier; the only ones enriched further
    pub valid: Vec<ValidRow>,
    pub not_found: Vec<IdentifiedRow>,
    pub duplicates: Vec<IdentifiedRow>,
    pub api_errors: Vec<IdentifiedRow>,
}

impl Classification {
    /// Every row kept out of enrichment, in input order
    pub fn excluded(&self) -> Vec<IdentifiedRow> {
        let mut rows: Vec<IdentifiedRow> = self
            .not_found
            .iter()
            .chain(&self.duplicates)
            .chain(&self.api_errors)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row.position);
        rows
    }
}

pub fn classify(rows: Vec<IdentifiedRow>) -> Classification {
    let mut split = Classification::default();

    for identified in rows {
        match identified.person_id {
            PersonId::NotFound => split.not_found.push(identified),
            PersonId::MultipleFound => split.duplicates.push(identified),
            PersonId::ApiError => split.api_errors.push(identified),
            PersonId::Found(_) => {
                if let Ok(valid) = ValidRow::try_from_identified(identified) {
                    split.valid.push(valid);
                }
            }
        }
    }

    info!(
        "Classified rows: {} valid, {} not found, {} duplicates, {} lookup errors",
        split.valid.len(),
        split.not_found.len(),
        split.duplicates.len(),
        split.api_errors.len()
    );

    split
}
