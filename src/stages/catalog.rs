//! Service metadata lookup by test code

use super::StageContext;
use crate::gateway::{self, GatewayError, GatewayRequest, Lookup, Operation};
use crate::model::{CatalogedRow, RegistryTest, ValidRow};
use crate::progress::StageMeter;
use serde_json::{json, Value};
use tracing::debug;

pub async fn lookup_services(
    ctx: &StageContext,
    meter: &StageMeter<'_>,
    rows: Vec<ValidRow>,
) -> Result<Vec<CatalogedRow>, GatewayError> {
    let mut cataloged = Vec::with_capacity(rows.len());

    for (i, row) in rows.into_iter().enumerate() {
        let code = row.row().test_src.code.clone();
        let request = GatewayRequest::new(Operation::ServiceCatalog, catalog_payload(&code));

        let service = match ctx.lookup(request, &code).await? {
            Lookup::Found(value) => exact_match(&value, &code),
            Lookup::Skipped { .. } => None,
        };
        if service.is_none() {
            debug!("No catalog entry with code {}", code);
        }

        cataloged.push(row.with_service(service));
        meter.row_done(i).await;
    }

    Ok(cataloged)
}

fn catalog_payload(code: &str) -> Value {
    json!({
        "UslugaComplex_Code": code,
        "start": 0,
        "limit": 100,
    })
}

/// Candidate whose code equals `code` exactly (pure)
pub fn exact_match(response: &Value, code: &str) -> Option<RegistryTest> {
    gateway::records(response).into_iter().find_map(|candidate| {
        let candidate_code = gateway::text_field(candidate, "UslugaComplex_Code")?;
        (candidate_code == code).then(|| RegistryTest {
            id: gateway::text_field(candidate, "UslugaComplex_id").unwrap_or_default(),
            code: candidate_code,
            name: gateway::text_field(candidate, "UslugaComplex_Name").unwrap_or_default(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_code_is_accepted() {
        let response = json!([
            {
                "UslugaComplex_id": 1,
                "UslugaComplex_Code": "A09.05.010.001",
                "UslugaComplex_Name": "Longer"
            },
            {
                "UslugaComplex_id": 2,
                "UslugaComplex_Code": "A09.05.010",
                "UslugaComplex_Name": "Protein"
            },
        ]);

        let found = exact_match(&response, "A09.05.010").unwrap();
        assert_eq!(found.id, "2");
        assert_eq!(found.name, "Protein");
    }

    #[test]
    fn test_prefix_match_is_rejected() {
        let response = json!({
            "data": [{"UslugaComplex_id": 1, "UslugaComplex_Code": "A09.05.010.001"}]
        });
        assert!(exact_match(&response, "A09.05.010").is_none());
        assert!(exact_match(&json!({}), "A09.05.010").is_none());
    }
}
