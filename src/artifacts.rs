//! Per-task JSON snapshots of the row set after each stage

use crate::error::PipelineResult;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RAW_ROWS: &str = "01.raw_rows.json";
pub const SANITIZED_ROWS: &str = "02.sanitized_rows.json";
pub const IDENTIFIED_ROWS: &str = "03.identified_rows.json";
pub const VALID_ROWS: &str = "04.valid_rows.json";
pub const CATALOGED_ROWS: &str = "05.cataloged_rows.json";
pub const HISTORIED_ROWS: &str = "06.historied_rows.json";
pub const NARROWED_ROWS: &str = "07.narrowed_rows.json";
pub const PRICED_ROWS: &str = "08.priced_rows.json";
pub const ENRICHED_ROWS: &str = "09.enriched_rows.json";
pub const REPORT_RECORDS: &str = "10.report_records.json";
pub const NOT_FOUND: &str = "not_found.json";
pub const DUPLICATES: &str = "duplicates.json";

pub const REPORT_FILE: &str = "report.xlsx";

/// Result directory of one task: `<results_dir>/<task_id>/`
#[derive(Debug, Clone)]
pub struct TaskArtifacts {
    dir: PathBuf,
}

impl TaskArtifacts {
    pub async fn create(results_dir: &Path, task_id: &str) -> PipelineResult<Self> {
        let dir = results_dir.join(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Location of a task's report without touching the filesystem
    pub fn report_path_for(results_dir: &Path, task_id: &str) -> PathBuf {
        results_dir.join(task_id).join(REPORT_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    /// Write `value` as pretty JSON under `name`
    pub async fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> PipelineResult<()> {
        let path = self.dir.join(name);
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await?;
        debug!("Saved artifact {}", path.display());
        Ok(())
    }
}
