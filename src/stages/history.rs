//! Test-history lookup and narrowing

use super::StageContext;
use crate::gateway::{self, GatewayError, GatewayRequest, Lookup, Operation};
use crate::model::{CatalogedRow, HistoriedRow, HistoryItem, RegistryTest};
use crate::progress::StageMeter;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{json, Value};
use tracing::debug;

const LAB_ATTRIBUTE: &str = "lab";
const HISTORY_SORT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Attach each person's laboratory history to their rows
pub async fn lookup_histories(
    ctx: &StageContext,
    meter: &StageMeter<'_>,
    rows: Vec<CatalogedRow>,
) -> Result<Vec<HistoriedRow>, GatewayError> {
    let mut historied = Vec::with_capacity(rows.len());

    for (i, row) in rows.into_iter().enumerate() {
        let request = GatewayRequest::new(
            Operation::TestHistory,
            json!({ "Person_id": row.person_id }),
        );
        let items = match ctx.lookup(request, &row.person_id).await? {
            Lookup::Found(value) => lab_items(&value),
            Lookup::Skipped { .. } => Vec::new(),
        };

        debug!(
            "Person {} has {} laboratory events",
            row.person_id,
            items.len()
        );
        historied.push(row.with_history(items));
        meter.row_done(i).await;
    }

    Ok(historied)
}

/// Laboratory-class entries of a raw history response (pure)
pub fn lab_items(response: &Value) -> Vec<HistoryItem> {
    gateway::records(response)
        .into_iter()
        .filter(|record| is_lab_event(record))
        .map(history_item)
        .collect()
}

fn is_lab_event(record: &Value) -> bool {
    record
        .get("UslugaComplex_AttributeList")
        .and_then(Value::as_str)
        .is_some_and(|list| {
            list.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .any(|token| token.eq_ignore_ascii_case(LAB_ATTRIBUTE))
        })
}

fn history_item(record: &Value) -> HistoryItem {
    HistoryItem {
        event_id: gateway::text_field(record, "Evn_id"),
        med_personal_id: gateway::text_field(record, "ED_MedPersonal_id"),
        date: gateway::text_field(record, "EvnUslugaPar_setDate"),
        test_name: gateway::text_field(record, "UslugaComplex_Name"),
        tests_group_name: gateway::text_field(record, "MedService_Name"),
        test_id: gateway::text_field(record, "UslugaComplex_id"),
        sort: gateway::text_field(record, "sort"),
    }
}

/// Narrow a row's history to the entries for its registry test
pub fn narrow_row(row: HistoriedRow) -> HistoriedRow {
    let tests_history = narrow_history(
        row.tests_history,
        row.test_registry.as_ref(),
        &row.row.visit_date,
    );
    HistoriedRow {
        tests_history,
        ..row
    }
}

/// Keep the entries for the registry test; several become the one nearest the visit
///
/// Entries with unparseable timestamps rank after all others and ties keep
/// registry order, so the pick is deterministic. Without a known registry
/// test the history is returned untouched.
pub fn narrow_history(
    items: Vec<HistoryItem>,
    test_registry: Option<&RegistryTest>,
    visit_date: &str,
) -> Vec<HistoryItem> {
    let Some(test) = test_registry.filter(|t| !t.id.is_empty()) else {
        return items;
    };

    let matching: Vec<HistoryItem> = items
        .into_iter()
        .filter(|item| item.test_id.as_deref() == Some(test.id.as_str()))
        .collect();
    if matching.len() <= 1 {
        return matching;
    }

    let Ok(visit) = NaiveDate::parse_from_str(visit_date, "%d.%m.%Y") else {
        debug!("Unparseable visit date {}, keeping first history match", visit_date);
        return matching.into_iter().take(1).collect();
    };
    let visit = visit.and_time(NaiveTime::MIN);

    matching
        .into_iter()
        .min_by_key(|item| distance_rank(item, visit))
        .into_iter()
        .collect()
}

fn distance_rank(item: &HistoryItem, visit: NaiveDateTime) -> (bool, i64) {
    item.sort
        .as_deref()
        .and_then(|s| NaiveDateTime::parse_from_str(s, HISTORY_SORT_FORMAT).ok())
        .map(|at| (false, (at - visit).num_seconds().abs()))
        .unwrap_or((true, 0))
}
