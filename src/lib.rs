//! Requisition enricher
//!
//! Reconciles lab-test requisition spreadsheets against a remote medical
//! registry and produces an annotated report for billing review.
//!
//! # Overview
//!
//! An uploaded workbook goes through a fixed sequence of stages:
//! - ingestion and sanitization of the raw rows ([`ingest`])
//! - patient identity resolution and classification ([`stages`])
//! - service, test history and payment-type lookups against the registry
//!   gateway ([`gateway`]), memoized process-wide ([`cache`])
//! - report flattening and spreadsheet output ([`report`])
//!
//! Progress of every task is streamed to an optional observer ([`progress`]).
//!
//! # Quick Start
//!
//! ```rust
//! use requisition_enricher::report::resolve_outcome;
//! use requisition_enricher::model::PersonId;
//!
//! let (pay_type, comment) = resolve_outcome(&PersonId::NotFound, None, None, "B03.016.002");
//! assert!(pay_type.is_empty());
//! assert_eq!(comment, "patient not found in registry");
//! ```

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod server;
pub mod stages;
pub mod testing;

pub use config::AppConfig;
pub use error::{PipelineError, PipelineResult};
pub use gateway::{GatewayClient, GatewayError, Operation, RegistryGateway};
pub use pipeline::{EnrichmentOutcome, EnrichmentPipeline};
pub use progress::{ProgressEvent, ProgressHub, ProgressSink, TaskProgress};
