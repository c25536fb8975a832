//! Registry gateway abstraction
//!
//! Every registry operation goes through one proxied endpoint and differs
//! only in its operation selector and payload. This module defines the
//! operation set, the request envelope, the failure taxonomy and the
//! [`RegistryGateway`] trait the enrichment stages depend on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod client;

pub use client::{GatewayClient, GatewayClientConfig};

/// Logical registry operations used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    PersonSearch,
    ServiceCatalog,
    TestHistory,
    TestReport,
    MedicalHistory,
    EventPayType,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::PersonSearch,
        Operation::ServiceCatalog,
        Operation::TestHistory,
        Operation::TestReport,
        Operation::MedicalHistory,
        Operation::EventPayType,
    ];

    /// Controller and method selector understood by the gateway
    pub fn selector(self) -> (&'static str, &'static str) {
        match self {
            Operation::PersonSearch => ("Person", "getPersonSearchGrid"),
            Operation::ServiceCatalog => ("UslugaComplex", "loadUslugaComplexList"),
            Operation::TestHistory => ("EvnUsluga", "loadEvnUslugaGrid"),
            Operation::TestReport => ("Template", "getEvnForm"),
            Operation::MedicalHistory => ("EMK", "loadPersonEvnHistory"),
            Operation::EventPayType => ("EvnVizit", "loadEvnVizitPLEditForm"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::PersonSearch => "person_search",
            Operation::ServiceCatalog => "service_catalog",
            Operation::TestHistory => "test_history",
            Operation::TestReport => "test_report",
            Operation::MedicalHistory => "medical_history",
            Operation::EventPayType => "event_pay_type",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One call to the gateway endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub operation: Operation,
    pub data: Value,
    /// Extra headers; these win over the client's fixed header set
    pub headers: BTreeMap<String, String>,
}

impl GatewayRequest {
    pub fn new(operation: Operation, data: Value) -> Self {
        Self {
            operation,
            data,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Wire body: `{params: {c, m, _dc}, data: {...}}`
    pub fn body(&self) -> Value {
        let (controller, method) = self.operation.selector();
        json!({
            "params": {
                "c": controller,
                "m": method,
                "_dc": chrono::Utc::now().timestamp_millis(),
            },
            "data": self.data,
        })
    }
}

/// Gateway call failures
///
/// Client-range rejections and undecodable bodies concern a single lookup and
/// degrade that row only. Everything else means the registry cannot be used
/// and aborts the task.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway rejected {operation} request ({status}): {body}")]
    Rejected {
        operation: Operation,
        status: u16,
        body: String,
    },
    #[error("Gateway returned an undecodable {operation} response: {message}")]
    InvalidBody { operation: Operation, message: String },
    #[error("Registry gateway unavailable ({status}) during {operation}")]
    Unavailable { operation: Operation, status: u16 },
    #[error("Failed to reach registry gateway during {operation}: {message}")]
    Network { operation: Operation, message: String },
    #[error("Invalid gateway header {name}")]
    InvalidHeader { name: String },
}

impl GatewayError {
    /// True when only the current row's lookup is affected
    pub fn is_row_skippable(&self) -> bool {
        matches!(
            self,
            GatewayError::Rejected { .. } | GatewayError::InvalidBody { .. }
        )
    }

    /// True when the whole task must stop
    pub fn is_fatal(&self) -> bool {
        !self.is_row_skippable()
    }
}

/// Remote registry access, injected into the pipeline
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Execute one operation; an empty successful body yields an empty object
    async fn call(&self, request: &GatewayRequest) -> Result<Value, GatewayError>;
}

/// Memoizable outcome of a lookup that did not abort the task
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Value),
    /// The gateway refused or garbled this particular lookup
    Skipped { reason: String },
}

/// Records of a response that is either a raw array or an object with a `data` array
pub fn records(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Read an identifier-like field that the registry may send as text or number
pub fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_envelope() {
        let request = GatewayRequest::new(Operation::PersonSearch, json!({"page": 1}));
        let body = request.body();

        assert_eq!(body["params"]["c"], "Person");
        assert_eq!(body["params"]["m"], "getPersonSearchGrid");
        assert!(body["params"]["_dc"].is_i64());
        assert_eq!(body["data"]["page"], 1);
    }

    #[test]
    fn test_error_classification() {
        let rejected = GatewayError::Rejected {
            operation: Operation::ServiceCatalog,
            status: 404,
            body: String::new(),
        };
        assert!(rejected.is_row_skippable());
        assert!(!rejected.is_fatal());

        let invalid = GatewayError::InvalidBody {
            operation: Operation::TestReport,
            message: "expected value".to_string(),
        };
        assert!(invalid.is_row_skippable());

        let unavailable = GatewayError::Unavailable {
            operation: Operation::TestHistory,
            status: 502,
        };
        assert!(unavailable.is_fatal());

        let network = GatewayError::Network {
            operation: Operation::PersonSearch,
            message: "connection refused".to_string(),
        };
        assert!(network.is_fatal());
        assert!(GatewayError::InvalidHeader {
            name: "bad header".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_records_accepts_array_and_data_wrapper() {
        let raw = json!([{"a": 1}, {"a": 2}]);
        assert_eq!(records(&raw).len(), 2);

        let wrapped = json!({"data": [{"a": 1}], "totalCount": 1});
        assert_eq!(records(&wrapped).len(), 1);

        assert!(records(&json!({})).is_empty());
        assert!(records(&json!("text")).is_empty());
    }

    #[test]
    fn test_text_field_reads_numbers_and_strings() {
        let value = json!({"id": 123, "code": " A09 ", "blank": "", "nothing": null});
        assert_eq!(text_field(&value, "id"), Some("123".to_string()));
        assert_eq!(text_field(&value, "code"), Some("A09".to_string()));
        assert_eq!(text_field(&value, "blank"), None);
        assert_eq!(text_field(&value, "nothing"), None);
        assert_eq!(text_field(&value, "missing"), None);
    }

    #[test]
    fn test_operation_names_are_unique() {
        let mut names: Vec<_> = Operation::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Operation::ALL.len());
    }
}
