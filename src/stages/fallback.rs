//! Fallback payment-type resolution through the general medical history
//!
//! Only rows the primary stage left unclassified are looked at. The first
//! billable event inside the window before the visit decides the payment
//! type via its child visit record.

use super::StageContext;
use crate::gateway::{self, GatewayError, GatewayRequest, Lookup, Operation};
use crate::model::{EnrichedRow, MedicalEvent, PaymentSource, PricedRow, TestReport};
use crate::progress::StageMeter;
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Event types that never carry a billable visit
const NON_BILLABLE_EVENT_TYPES: [&str; 3] = ["direction", "par", "disp"];
const REGISTRY_DATE_FORMAT: &str = "%d.%m.%Y";

pub async fn resolve_fallbacks(
    ctx: &StageContext,
    meter: &StageMeter<'_>,
    rows: Vec<PricedRow>,
) -> Result<Vec<EnrichedRow>, GatewayError> {
    let mut enriched = Vec::with_capacity(rows.len());

    for (i, row) in rows.into_iter().enumerate() {
        let finished = if row.needs_fallback() {
            let (history, report) = fallback_for(ctx, &row).await?;
            row.with_fallback(history, report)
        } else {
            row.resolved()
        };

        enriched.push(finished);
        meter.row_done(i).await;
    }

    Ok(enriched)
}

async fn fallback_for(
    ctx: &StageContext,
    row: &PricedRow,
) -> Result<(Vec<MedicalEvent>, Option<TestReport>), GatewayError> {
    let Ok(visit) = NaiveDate::parse_from_str(&row.row.visit_date, REGISTRY_DATE_FORMAT) else {
        warn!(
            "Line {} has unparseable visit date '{}', skipping medical history",
            row.row.position, row.row.visit_date
        );
        return Ok((Vec::new(), None));
    };

    let request = GatewayRequest::new(
        Operation::MedicalHistory,
        json!({ "Person_id": row.person_id }),
    );
    let history = match ctx.lookup(request, &row.person_id).await? {
        Lookup::Found(value) => events_in_window(&value, visit, ctx.history_window_days()),
        Lookup::Skipped { .. } => Vec::new(),
    };

    let Some(first) = history.first() else {
        debug!("No billable events near visit for person {}", row.person_id);
        return Ok((history, None));
    };
    let Some(event_id) = first.children_evn_id.clone() else {
        return Ok((history, None));
    };
    let staff_id = first.med_staff_fact_id.clone();

    let request = GatewayRequest::new(
        Operation::EventPayType,
        json!({ "EvnVizitPL_id": event_id }),
    );
    let report = match ctx.lookup(request, &event_id).await? {
        Lookup::Found(value) => pay_type_id(&value).map(|id| TestReport {
            pay_type_label: ctx.pay_types().label(&id),
            pay_type_id: id,
            staff_id,
            direction_id: None,
            source: PaymentSource::MedicalHistory,
        }),
        Lookup::Skipped { .. } => None,
    };

    Ok((history, report))
}

/// True when `event` lies in `(visit - days, visit]`
pub fn within_window(event: NaiveDate, visit: NaiveDate, days: i64) -> bool {
    event > visit - Duration::days(days) && event <= visit
}

/// Billable events of a medical-history response inside the window, in registry order (pure)
pub fn events_in_window(response: &Value, visit: NaiveDate, days: i64) -> Vec<MedicalEvent> {
    gateway::records(response)
        .into_iter()
        .filter_map(|record| {
            let evn_type = gateway::text_field(record, "EvnType")?;
            if NON_BILLABLE_EVENT_TYPES.contains(&evn_type.as_str()) {
                return None;
            }
            let date_set = gateway::text_field(record, "objectSetDate")?;
            let set = NaiveDate::parse_from_str(&date_set, REGISTRY_DATE_FORMAT).ok()?;
            if !within_window(set, visit, days) {
                return None;
            }

            let child = record.pointer("/children/0");
            Some(MedicalEvent {
                date_set,
                date_dis: gateway::text_field(record, "objectDisDate"),
                med_personal_id: gateway::text_field(record, "MedPersonal_id"),
                evn_class_name: gateway::text_field(record, "EvnClass_Name"),
                diag_code: gateway::text_field(record, "Diag_Code"),
                diag_name: gateway::text_field(record, "Diag_Name"),
                evn_type,
                children_evn_id: child.and_then(|c| gateway::text_field(c, "Evn_id")),
                med_staff_fact_id: child.and_then(|c| gateway::text_field(c, "MedStaffFact_id")),
            })
        })
        .collect()
}

/// Payment type of a visit record: raw array, `data` array or bare object
fn pay_type_id(response: &Value) -> Option<String> {
    gateway::records(response)
        .first()
        .and_then(|record| gateway::text_field(record, "PayType_id"))
        .or_else(|| gateway::text_field(response, "PayType_id"))
}
