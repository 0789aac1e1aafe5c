// 🔁 Pipeline - one historization run for one dataset
//
// normalize → read current rows → reconcile + allocate → apply
//
// Every stage returns its own error kind; nothing is retried here.

use crate::allocator::MemorySequence;
use crate::config::DatasetConfig;
use crate::db::{HistoryStore, MergeRun};
use crate::error::Result;
use crate::merge::{ChangeSet, MergeEngine};
use crate::normalize::{IngestContext, Normalizer};
use crate::parser::RawRow;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub records: usize,
    pub changes: ChangeSet,
    /// Audit entry, absent for dry runs and empty change sets
    pub run: Option<MergeRun>,
    pub dry_run: bool,
}

impl RunOutcome {
    pub fn summary(&self) -> String {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        format!("{} records → {}{}", self.records, self.changes.summary(), mode)
    }
}

/// Historize one snapshot. The run date of `ctx` is the as-of date.
pub fn ingest(
    store: &mut HistoryStore,
    dataset: &DatasetConfig,
    rows: &[RawRow],
    ctx: &IngestContext,
) -> Result<RunOutcome> {
    let (records, changes) = prepare(store, dataset, rows, ctx, false)?;
    let run = store.apply(&changes)?;

    let outcome = RunOutcome {
        records,
        changes,
        run,
        dry_run: false,
    };
    info!(dataset = %dataset.name, "{}", outcome.summary());
    Ok(outcome)
}

/// Compute the change set without writing history.
///
/// Record ids shown are what the next real run would most likely get; none are
/// reserved and nothing is written.
pub fn plan(
    store: &HistoryStore,
    dataset: &DatasetConfig,
    rows: &[RawRow],
    ctx: &IngestContext,
) -> Result<RunOutcome> {
    let (records, changes) = prepare(store, dataset, rows, ctx, true)?;

    let outcome = RunOutcome {
        records,
        changes,
        run: None,
        dry_run: true,
    };
    info!(dataset = %dataset.name, "{}", outcome.summary());
    Ok(outcome)
}

fn prepare(
    store: &HistoryStore,
    dataset: &DatasetConfig,
    rows: &[RawRow],
    ctx: &IngestContext,
    dry_run: bool,
) -> Result<(usize, ChangeSet)> {
    info!(dataset = %dataset.name, as_of = %ctx.run_date, rows = rows.len(), dry_run, "starting run");

    let records = Normalizer::new(dataset).normalize(rows, ctx)?;
    let current = store.current_rows(&dataset.name)?;
    let plan = MergeEngine::new(&dataset.name).reconcile(&current, &records, ctx.run_date)?;

    let changes = if dry_run {
        let mut seq = MemorySequence::starting_after(store.last_record_id()?);
        plan.allocate(&mut seq)?
    } else {
        let mut seq = store.sequence()?;
        plan.allocate(&mut seq)?
    };

    Ok((records.len(), changes))
}
