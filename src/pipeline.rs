//! Enrichment task orchestration
//!
//! One task reads an uploaded workbook, runs the enrichment stages in order
//! and writes the annotated report. Stages run strictly one after another
//! and each processes its rows sequentially. A snapshot of the row set is
//! flushed after every stage.
//!
//! | progress | step                                   |
//! |----------|----------------------------------------|
//! | 2        | read workbook                          |
//! | 5        | sanitize rows                          |
//! | 10..20   | identity resolution                    |
//! | 20       | classification                         |
//! | 25       | follow-up lists                        |
//! | 30..40   | service metadata                       |
//! | 40..50   | test history                           |
//! | 60       | history narrowing                      |
//! | 70..80   | payment type from test report          |
//! | 80..90   | payment type from medical history      |
//! | 90       | report                                 |

use crate::artifacts::{self, TaskArtifacts};
use crate::cache::LookupCache;
use crate::config::{AppConfig, WorkbookSection};
use crate::error::PipelineResult;
use crate::gateway::{Lookup, RegistryGateway};
use crate::ingest::sanitize_rows;
use crate::model::{EnrichedRow, IdentifiedRow, Row};
use crate::progress::{ProgressSink, StageMeter, TaskProgress};
use crate::report::workbook::{ReportContent, SourceWorkbook};
use crate::report::{self, FollowUpEntry, ReportRecord};
use crate::stages::{self, catalog, fallback, history, identity, payment, StageContext};
use crate::{stage_span, task_span};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Instrument};

/// Result of the enrichment stages for one task
#[derive(Debug, Default)]
pub struct EnrichmentOutcome {
    pub excluded: Vec<IdentifiedRow>,
    pub enriched: Vec<EnrichedRow>,
    pub records: Vec<ReportRecord>,
    pub not_found: Vec<FollowUpEntry>,
    pub duplicates: Vec<FollowUpEntry>,
}

pub struct EnrichmentPipeline {
    context: StageContext,
    sink: Arc<dyn ProgressSink>,
    workbook: WorkbookSection,
    results_dir: PathBuf,
}

impl EnrichmentPipeline {
    pub fn new(
        gateway: Arc<dyn RegistryGateway>,
        cache: Arc<LookupCache<Lookup>>,
        sink: Arc<dyn ProgressSink>,
        config: &AppConfig,
    ) -> Self {
        let context = StageContext::new(
            gateway,
            cache,
            config.pay_types.clone(),
            config.enrichment.history_window_days,
        );
        Self {
            context,
            sink,
            workbook: config.workbook.clone(),
            results_dir: config.server.results_dir.clone(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Run one task to completion, reporting the outcome as a terminal event
    ///
    /// Returns the report location on success. Failures are logged and
    /// published; they never escape.
    pub async fn run(
        &self,
        task_id: &str,
        input: &Path,
        download_url: Option<String>,
    ) -> Option<PathBuf> {
        let progress = TaskProgress::new(task_id, self.sink.clone());

        async {
            info!("Starting task {} for {}", task_id, input.display());
            match self.execute(&progress, input).await {
                Ok(report_path) => {
                    info!("Task {} completed: {}", task_id, report_path.display());
                    progress
                        .complete("Report is ready for download", download_url)
                        .await;
                    Some(report_path)
                }
                Err(e) => {
                    error!("Task {} failed: {}", task_id, e);
                    progress.fail(e.user_message()).await;
                    None
                }
            }
        }
        .instrument(task_span!(task_id = %task_id))
        .await
    }

    async fn execute(&self, progress: &TaskProgress, input: &Path) -> PipelineResult<PathBuf> {
        let artifacts = TaskArtifacts::create(&self.results_dir, progress.task_id()).await?;

        progress.update(2, "Reading requisition workbook...").await;
        let input_path = input.to_path_buf();
        let layout = self.workbook.clone();
        let (source, raw_rows) = tokio::task::spawn_blocking(move || {
            let source = SourceWorkbook::open(&input_path)?;
            let rows = report::read_requisitions(&source, &layout)?;
            Ok::<_, report::WorkbookError>((source, rows))
        })
        .await??;
        artifacts.save(artifacts::RAW_ROWS, &raw_rows).await?;

        progress.update(5, "Preparing data...").await;
        let rows = sanitize_rows(&raw_rows)?;
        artifacts.save(artifacts::SANITIZED_ROWS, &rows).await?;

        let outcome = self.enrich(progress, &artifacts, rows).await?;

        let report_path = artifacts.report_path();
        let output = report_path.clone();
        tokio::task::spawn_blocking(move || {
            report::write_report(
                &output,
                &source,
                &ReportContent {
                    records: &outcome.records,
                    not_found: &outcome.not_found,
                    duplicates: &outcome.duplicates,
                },
            )
        })
        .await??;

        Ok(report_path)
    }

    /// Run the enrichment stages over sanitized rows
    pub async fn enrich(
        &self,
        progress: &TaskProgress,
        artifacts: &TaskArtifacts,
        rows: Vec<Row>,
    ) -> PipelineResult<EnrichmentOutcome> {
        let ctx = &self.context;

        let meter = StageMeter::new(
            progress,
            10,
            20,
            rows.len(),
            "Looking up patients in registry...",
        );
        meter.begin().await;
        let identified = identity::resolve_identities(ctx, &meter, rows)
            .instrument(stage_span!(stage = "identity"))
            .await?;
        artifacts.save(artifacts::IDENTIFIED_ROWS, &identified).await?;

        progress.update(20, "Analyzing identities...").await;
        let split = stages::classify(identified);
        artifacts.save(artifacts::VALID_ROWS, &split.valid).await?;
        artifacts.save(artifacts::NOT_FOUND, &split.not_found).await?;
        artifacts.save(artifacts::DUPLICATES, &split.duplicates).await?;

        progress.update(25, "Collecting not found and duplicate patients...").await;
        let not_found = report::follow_up_entries(&split.not_found);
        let duplicates = report::follow_up_entries(&split.duplicates);
        let excluded = split.excluded();
        let valid = split.valid;

        let meter = StageMeter::new(
            progress,
            30,
            40,
            valid.len(),
            "Looking up services in registry...",
        );
        meter.begin().await;
        let cataloged = catalog::lookup_services(ctx, &meter, valid)
            .instrument(stage_span!(stage = "catalog"))
            .await?;
        artifacts.save(artifacts::CATALOGED_ROWS, &cataloged).await?;

        let meter = StageMeter::new(
            progress,
            40,
            50,
            cataloged.len(),
            "Fetching test histories...",
        );
        meter.begin().await;
        let historied = history::lookup_histories(ctx, &meter, cataloged)
            .instrument(stage_span!(stage = "history"))
            .await?;
        artifacts.save(artifacts::HISTORIED_ROWS, &historied).await?;

        progress.update(60, "Narrowing test histories...").await;
        let narrowed: Vec<_> = historied.into_iter().map(history::narrow_row).collect();
        artifacts.save(artifacts::NARROWED_ROWS, &narrowed).await?;

        let meter = StageMeter::new(
            progress,
            70,
            80,
            narrowed.len(),
            "Resolving payment type #1...",
        );
        meter.begin().await;
        let priced = payment::resolve_pay_types(ctx, &meter, narrowed)
            .instrument(stage_span!(stage = "payment"))
            .await?;
        artifacts.save(artifacts::PRICED_ROWS, &priced).await?;

        let meter = StageMeter::new(
            progress,
            80,
            90,
            priced.len(),
            "Resolving payment type #2...",
        );
        meter.begin().await;
        let enriched = fallback::resolve_fallbacks(ctx, &meter, priced)
            .instrument(stage_span!(stage = "fallback"))
            .await?;
        artifacts.save(artifacts::ENRICHED_ROWS, &enriched).await?;

        progress.update(90, "Preparing report...").await;
        let records = report::flatten(&excluded, &enriched);
        artifacts.save(artifacts::REPORT_RECORDS, &records).await?;

        Ok(EnrichmentOutcome {
            excluded,
            enriched,
            records,
            not_found,
            duplicates,
        })
    }
}
