//! Identity resolution: one person search per row

use super::StageContext;
use crate::gateway::{self, GatewayError, GatewayRequest, Lookup, Operation};
use crate::model::{IdentifiedRow, Person, PersonId, Row};
use crate::progress::StageMeter;
use serde_json::{json, Value};
use tracing::debug;

/// Resolve a registry identity for every row
///
/// Every row comes out with an identifier or a sentinel status; only fatal
/// gateway failures escape.
pub async fn resolve_identities(
    ctx: &StageContext,
    meter: &StageMeter<'_>,
    rows: Vec<Row>,
) -> Result<Vec<IdentifiedRow>, GatewayError> {
    let mut identified = Vec::with_capacity(rows.len());

    for (i, row) in rows.into_iter().enumerate() {
        let person_id = find_person(ctx, &row.person).await?;
        debug!("Line {} resolved to person {}", row.position, person_id);
        identified.push(IdentifiedRow { row, person_id });
        meter.row_done(i).await;
    }

    Ok(identified)
}

async fn find_person(ctx: &StageContext, person: &Person) -> Result<PersonId, GatewayError> {
    let key = search_key(person);
    let request = GatewayRequest::new(Operation::PersonSearch, search_payload(person));

    Ok(match ctx.lookup(request, &key).await? {
        Lookup::Found(value) => interpret_search(&value),
        Lookup::Skipped { .. } => PersonId::ApiError,
    })
}

fn search_key(person: &Person) -> String {
    [
        person.last_name.as_str(),
        person.first_name.as_str(),
        person.middle_name.as_str(),
        person.birth_day.as_str(),
    ]
    .join("\u{1f}")
}

fn search_payload(person: &Person) -> Value {
    json!({
        "PersonSurName_SurName": person.last_name,
        "PersonFirName_FirName": person.first_name,
        "PersonSecName_SecName": person.middle_name,
        "PersonBirthDay_BirthDay": person.birth_day,
        "showAll": 1,
        "searchMode": "all",
        "allowOverLimit": 1,
        "page": 1,
        "start": 0,
        "limit": 100,
    })
}

/// Map a search response onto an identity outcome (pure)
pub fn interpret_search(response: &Value) -> PersonId {
    let Some(count) = total_count(response) else {
        return PersonId::ApiError;
    };

    match count {
        0 => PersonId::NotFound,
        1 => gateway::records(response)
            .first()
            .and_then(|record| gateway::text_field(record, "Person_id"))
            .map(PersonId::from_registry)
            .unwrap_or(PersonId::ApiError),
        n if n > 1 => PersonId::MultipleFound,
        _ => PersonId::ApiError,
    }
}

fn total_count(response: &Value) -> Option<i64> {
    match response.get("totalCount")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
