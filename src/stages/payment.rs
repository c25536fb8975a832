//! Primary payment-type resolution through the lab event's report

use super::StageContext;
use crate::config::PayTypeTable;
use crate::gateway::{self, GatewayError, GatewayRequest, Lookup, Operation};
use crate::model::{HistoriedRow, PaymentSource, PricedRow, TestReport};
use crate::progress::StageMeter;
use serde_json::{json, Value};
use tracing::debug;

pub async fn resolve_pay_types(
    ctx: &StageContext,
    meter: &StageMeter<'_>,
    rows: Vec<HistoriedRow>,
) -> Result<Vec<PricedRow>, GatewayError> {
    let mut priced = Vec::with_capacity(rows.len());

    for (i, row) in rows.into_iter().enumerate() {
        let report = match report_event_id(&row) {
            Some(event_id) => fetch_report(ctx, &event_id).await?,
            None => None,
        };
        if report.is_none() {
            debug!(
                "No payment type from test report for line {}",
                row.row.position
            );
        }

        priced.push(row.with_report(report));
        meter.row_done(i).await;
    }

    Ok(priced)
}

/// Event whose report is consulted; requires a known service and some history
fn report_event_id(row: &HistoriedRow) -> Option<String> {
    row.test_registry.as_ref()?;
    row.tests_history.first()?.event_id.clone()
}

async fn fetch_report(
    ctx: &StageContext,
    event_id: &str,
) -> Result<Option<TestReport>, GatewayError> {
    let request = GatewayRequest::new(
        Operation::TestReport,
        json!({
            "Evn_id": event_id,
            "EvnClass_SysNick": "EvnUslugaPar",
        }),
    );

    Ok(match ctx.lookup(request, event_id).await? {
        Lookup::Found(value) => parse_report(&value, ctx.pay_types()),
        Lookup::Skipped { .. } => None,
    })
}

/// Read the payment classification out of a report response (pure)
pub fn parse_report(response: &Value, pay_types: &PayTypeTable) -> Option<TestReport> {
    let data = response
        .pointer("/map/EvnUslugaPar/item/0/data")
        .filter(|data| data.is_object())?;
    let pay_type_id = gateway::text_field(data, "PayType_id")?;

    Some(TestReport {
        pay_type_label: pay_types.label(&pay_type_id),
        pay_type_id,
        staff_id: gateway::text_field(data, "MedStaffFact_id"),
        direction_id: gateway::text_field(data, "EvnDirection_id"),
        source: PaymentSource::TestReport,
    })
}
