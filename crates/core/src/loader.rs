use crate::config::Settings;
use crate::domain::bar::DailyBar;
use crate::storage::bars::{max_chunk_size, BarSink, InvalidTableName, TargetTable};
use serde::Serialize;
use thiserror::Error;

/// What to do with the remaining batches after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    StopOnFirst,
    Continue,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub target_table: TargetTable,
    pub chunk_size: usize,
    pub pre_sql: Option<String>,
    pub post_sql: Option<String>,
    pub policy: BatchFailurePolicy,
}

impl LoadOptions {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let target_table = TargetTable::parse(settings.require_target_table()?)?;
        Ok(Self {
            target_table,
            chunk_size: settings.load_chunk_size,
            pre_sql: settings.pre_load_sql.clone(),
            post_sql: settings.post_load_sql.clone(),
            policy: if settings.load_continue_on_error {
                BatchFailurePolicy::Continue
            } else {
                BatchFailurePolicy::StopOnFirst
            },
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTableName),

    #[error("chunk size {0} is out of range (1..={max})", max = max_chunk_size())]
    InvalidChunkSize(usize),

    /// Nothing was inserted; the target is in an unknown state.
    #[error("pre-load statement failed: {0}")]
    PreLoad(#[source] sqlx::Error),

    /// Every batch landed but the post-load statement did not.
    #[error("post-load statement failed: {0}")]
    PostLoad(#[source] sqlx::Error),
}

/// One failed insert batch. Rows `[start_row, end_row)` of the dataset were not loaded.
#[derive(Debug, Clone, Error, Serialize)]
#[error("batch {batch_index} (rows {start_row}..{end_row}) failed: {reason}")]
pub struct BatchLoadError {
    pub batch_index: usize,
    pub start_row: usize,
    pub end_row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub rows_attempted: usize,
    pub rows_loaded: u64,
    pub batches_total: usize,
    pub batches_attempted: usize,
    pub batch_failures: Vec<BatchLoadError>,
    pub post_load_ran: bool,
}

impl LoadSummary {
    pub fn is_complete(&self) -> bool {
        self.batch_failures.is_empty()
    }

    /// Where the load stopped early, if it did.
    pub fn abort_point(&self) -> Option<&BatchLoadError> {
        if self.batches_attempted < self.batches_total {
            self.batch_failures.last()
        } else {
            None
        }
    }
}

/// Runs pre-load, sequential chunked inserts, then post-load.
///
/// Pre/post failures are errors. Batch failures are reported in the summary,
/// and the post-load statement only runs when every batch succeeded.
pub async fn load(
    sink: &dyn BarSink,
    dataset: &[DailyBar],
    opts: &LoadOptions,
) -> Result<LoadSummary, LoadError> {
    let chunk_size = opts.chunk_size;
    if chunk_size == 0 || chunk_size > max_chunk_size() {
        return Err(LoadError::InvalidChunkSize(chunk_size));
    }
    let table = &opts.target_table;

    if let Some(pre_sql) = opts.pre_sql.as_deref() {
        let affected = sink.execute(pre_sql).await.map_err(LoadError::PreLoad)?;
        tracing::info!(%table, affected, "pre-load statement done");
    }

    let mut summary = LoadSummary {
        batches_total: dataset.len().div_ceil(chunk_size),
        ..Default::default()
    };

    for (batch_index, chunk) in dataset.chunks(chunk_size).enumerate() {
        let start_row = batch_index * chunk_size;
        let end_row = start_row + chunk.len();
        let t0 = std::time::Instant::now();

        summary.batches_attempted += 1;
        summary.rows_attempted += chunk.len();

        match sink.insert_batch(table, chunk).await {
            Ok(inserted) => {
                summary.rows_loaded += inserted;
                tracing::debug!(
                    %table,
                    batch_index,
                    batch_size = chunk.len(),
                    elapsed_ms = t0.elapsed().as_millis(),
                    "batch insert"
                );
            }
            Err(err) => {
                tracing::error!(
                    %table,
                    batch_index,
                    start_row,
                    end_row,
                    error = %err,
                    "batch insert failed"
                );
                summary.batch_failures.push(BatchLoadError {
                    batch_index,
                    start_row,
                    end_row,
                    reason: err.to_string(),
                });
                if opts.policy == BatchFailurePolicy::StopOnFirst {
                    break;
                }
            }
        }
    }

    if !summary.is_complete() {
        if opts.post_sql.is_some() {
            tracing::warn!(%table, "skipping post-load statement after batch failures");
        }
        return Ok(summary);
    }

    if let Some(post_sql) = opts.post_sql.as_deref() {
        let affected = sink.execute(post_sql).await.map_err(LoadError::PostLoad)?;
        summary.post_load_ran = true;
        tracing::info!(%table, affected, "post-load statement done");
    }

    tracing::info!(
        %table,
        rows_loaded = summary.rows_loaded,
        batches = summary.batches_total,
        "load phase done"
    );
    Ok(summary)
}
