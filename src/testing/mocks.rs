//! Mock implementations for testing
//!
//! Provides a scripted [`RegistryGateway`] and a recording [`ProgressSink`]
//! so the stages and the pipeline can be exercised without a live registry.

use crate::gateway::{GatewayError, GatewayRequest, Operation, RegistryGateway};
use crate::progress::{ProgressEvent, ProgressSink};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Canned outcome of one gateway call
#[derive(Debug, Clone)]
enum Scripted {
    Respond(Value),
    Reject(u16),
    Fail(u16),
    Disconnect,
}

impl Scripted {
    fn outcome(&self, operation: Operation) -> Result<Value, GatewayError> {
        match self {
            Scripted::Respond(value) => Ok(value.clone()),
            Scripted::Reject(status) => Err(GatewayError::Rejected {
                operation,
                status: *status,
                body: "scripted rejection".to_string(),
            }),
            Scripted::Fail(status) => Err(GatewayError::Unavailable {
                operation,
                status: *status,
            }),
            Scripted::Disconnect => Err(GatewayError::Network {
                operation,
                message: "scripted disconnect".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct Matcher {
    field: String,
    expected: Value,
    outcome: Scripted,
}

#[derive(Debug, Default)]
struct Script {
    defaults: HashMap<Operation, Scripted>,
    matchers: HashMap<Operation, Vec<Matcher>>,
    requests: HashMap<Operation, Vec<Value>>,
}

/// Gateway answering from a per-operation script
///
/// Matchers on a request field are checked in registration order before the
/// operation's default. Unscripted operations answer with an empty object.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Default response for every call of `operation`
    pub fn respond(&self, operation: Operation, response: Value) {
        self.script()
            .defaults
            .insert(operation, Scripted::Respond(response));
    }

    /// Response for calls whose `data[field]` equals `expected`
    pub fn respond_matching(
        &self,
        operation: Operation,
        field: &str,
        expected: Value,
        response: Value,
    ) {
        self.script()
            .matchers
            .entry(operation)
            .or_default()
            .push(Matcher {
                field: field.to_string(),
                expected,
                outcome: Scripted::Respond(response),
            });
    }

    /// Client-range rejection for every call of `operation`
    pub fn reject(&self, operation: Operation, status: u16) {
        self.script()
            .defaults
            .insert(operation, Scripted::Reject(status));
    }

    /// Server-range failure for every call of `operation`
    pub fn fail(&self, operation: Operation, status: u16) {
        self.script()
            .defaults
            .insert(operation, Scripted::Fail(status));
    }

    /// Transport failure for every call of `operation`
    pub fn disconnect(&self, operation: Operation) {
        self.script()
            .defaults
            .insert(operation, Scripted::Disconnect);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.script()
            .requests
            .get(&operation)
            .map_or(0, Vec::len)
    }

    /// Payloads received for `operation`, in call order
    pub fn requests(&self, operation: Operation) -> Vec<Value> {
        self.script()
            .requests
            .get(&operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.script().requests.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl RegistryGateway for ScriptedGateway {
    async fn call(&self, request: &GatewayRequest) -> Result<Value, GatewayError> {
        let operation = request.operation;
        let mut script = self.script();
        script
            .requests
            .entry(operation)
            .or_default()
            .push(request.data.clone());

        let matched = script.matchers.get(&operation).and_then(|matchers| {
            matchers
                .iter()
                .find(|m| request.data.get(&m.field) == Some(&m.expected))
                .map(|m| m.outcome.clone())
        });

        match matched.or_else(|| script.defaults.get(&operation).cloned()) {
            Some(scripted) => scripted.outcome(operation),
            None => Ok(json!({})),
        }
    }
}

/// Progress sink that keeps every published event
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, ProgressEvent)>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn events(&self) -> Vec<(String, ProgressEvent)> {
        self.lock().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn last_event(&self, task_id: &str) -> Option<ProgressEvent> {
        self.events_for(task_id).pop()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn publish(&self, task_id: &str, event: ProgressEvent) {
        self.lock().push((task_id.to_string(), event));
    }
}
