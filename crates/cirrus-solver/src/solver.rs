//! The solve loop: diff resolved candidates against the store and enqueue
//! executions.

use std::{
  collections::{BTreeMap, BTreeSet},
  path::PathBuf,
  time::Duration,
};

use cirrus_core::{
  dataset::{DataCatalog, SourceType},
  diagnostic::{ExecutionDefinition, PlannedExecution},
  provider::ProviderRegistry,
  store::{EvaluationStore, ExecutionStatus, GroupFilter, NewExecution},
};
use tracing::{debug, info, warn};

use crate::{Error, Result, resolver::resolve_diagnostic};

/// Name of the advisory lock serializing solver passes.
pub const SOLVER_LOCK: &str = "solver";

/// Lock lifetime; generous, but bounded so a crashed solver cannot wedge
/// the system.
const SOLVER_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// Options for [`solve_required_executions`].
#[derive(Debug, Clone)]
pub struct SolveOptions {
  /// Substring filter on provider slugs (case-sensitive).
  pub provider_filter:   Option<String>,
  /// Substring filter on diagnostic slugs (case-sensitive).
  pub diagnostic_filter: Option<String>,
  /// Resolve and report without writing anything.
  pub dry_run:           bool,
  /// Enqueue at most one new execution per provider (smoke testing).
  pub one_per_provider:  bool,
  /// Scratch root executions write their intermediate output under.
  pub scratch_root:      PathBuf,
}

impl SolveOptions {
  pub fn new(scratch_root: impl Into<PathBuf>) -> SolveOptions {
    SolveOptions {
      provider_filter:   None,
      diagnostic_filter: None,
      dry_run:           false,
      one_per_provider:  false,
      scratch_root:      scratch_root.into(),
    }
  }
}

/// Counters from one solve pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveSummary {
  pub candidates:         usize,
  pub groups_created:     usize,
  pub executions_created: usize,
  pub groups_flagged_stale: u64,
}

/// The result of a solve pass: counters plus the executions enqueued by it.
#[derive(Debug, Default)]
pub struct SolveOutcome {
  pub summary: SolveSummary,
  pub planned: Vec<PlannedExecution>,
}

/// Solve for executions that require calculation.
///
/// Serialized against concurrent solvers by the named advisory lock; two
/// successive solves with no catalog changes in between enqueue nothing
/// the second time.
pub async fn solve_required_executions<S: EvaluationStore>(
  store: &S,
  registry: &ProviderRegistry,
  options: &SolveOptions,
) -> Result<SolveOutcome> {
  let holder = format!("pid-{}", std::process::id());
  let acquired = store
    .try_acquire_lock(SOLVER_LOCK, &holder, SOLVER_LOCK_TTL)
    .await
    .map_err(Error::store)?;
  if !acquired {
    return Err(Error::SolverLocked);
  }

  let outcome = solve_inner(store, registry, options).await;

  if let Err(e) = store.release_lock(SOLVER_LOCK, &holder).await {
    warn!(error = %e, "failed to release the solver lock");
  }
  outcome
}

async fn solve_inner<S: EvaluationStore>(
  store: &S,
  registry: &ProviderRegistry,
  options: &SolveOptions,
) -> Result<SolveOutcome> {
  let mut outcome = SolveOutcome::default();

  // Sync the provider registry into the store; diagnostics that vanished
  // from the registry leave their groups flagged stale.
  if !options.dry_run {
    for provider in registry.providers() {
      let row = store
        .register_provider(provider.slug(), provider.version())
        .await
        .map_err(Error::store)?;
      for diagnostic in provider.diagnostics() {
        store
          .register_diagnostic(row.id, diagnostic.slug())
          .await
          .map_err(Error::store)?;
      }
    }
    outcome.summary.groups_flagged_stale = store
      .flag_stale_groups(&registry.slugs())
      .await
      .map_err(Error::store)?;
  }

  // One catalog load per source type, shared by every diagnostic.
  let mut catalogs: BTreeMap<SourceType, DataCatalog> = BTreeMap::new();
  for source_type in SourceType::ordered() {
    let catalog =
      store.load_catalog(*source_type).await.map_err(Error::store)?;
    catalogs.insert(*source_type, catalog);
  }

  let mut seen_groups: BTreeSet<(i64, String)> = BTreeSet::new();

  for provider in registry.providers() {
    if let Some(filter) = &options.provider_filter {
      if !provider.slug().contains(filter.as_str()) {
        continue;
      }
    }
    let mut provider_executions = 0usize;

    for diagnostic in provider.diagnostics() {
      if let Some(filter) = &options.diagnostic_filter {
        if !diagnostic.slug().contains(filter.as_str()) {
          continue;
        }
      }

      let candidates = resolve_diagnostic(&catalogs, diagnostic.as_ref())?;
      outcome.summary.candidates += candidates.len();

      if options.dry_run {
        for candidate in &candidates {
          info!(
            provider = provider.slug(),
            diagnostic = diagnostic.slug(),
            group_key = %candidate.group_key(),
            "candidate execution (dry run)"
          );
        }
        continue;
      }

      let Some(diagnostic_row) = store
        .find_diagnostic(provider.slug(), diagnostic.slug())
        .await
        .map_err(Error::store)?
      else {
        warn!(
          provider = provider.slug(),
          diagnostic = diagnostic.slug(),
          "diagnostic missing from the store after registration"
        );
        continue;
      };

      // One transaction per group keeps large catalogs incremental; a
      // crash mid-solve loses nothing but unprocessed candidates.
      for candidate in candidates {
        let key = candidate.group_key();
        let hash = candidate.dataset_hash();

        let (group, created) = store
          .ensure_group(diagnostic_row.id, &key)
          .await
          .map_err(Error::store)?;
        if created {
          info!(
            provider = provider.slug(),
            diagnostic = diagnostic.slug(),
            group_key = %key,
            "created execution group"
          );
          outcome.summary.groups_created += 1;
        }
        seen_groups.insert((diagnostic_row.id, key.canonical()));

        match store
          .find_execution(group.id, &hash)
          .await
          .map_err(Error::store)?
        {
          Some(existing)
            if existing.status == ExecutionStatus::Succeeded =>
          {
            debug!(
              group_key = %key,
              "up to date; a succeeded execution matches the dataset hash"
            );
          }
          Some(existing) => {
            debug!(
              group_key = %key,
              status = %existing.status,
              "an execution for this dataset hash already exists"
            );
          }
          None => {
            if options.one_per_provider && provider_executions >= 1 {
              debug!(
                provider = provider.slug(),
                group_key = %key,
                "skipping; one execution per provider requested"
              );
              continue;
            }

            store.mark_group_dirty(group.id).await.map_err(Error::store)?;

            let fragment_prefix = format!(
              "{}/{}/{}",
              provider.slug(),
              diagnostic.slug(),
              key.slug()
            );
            let execution = store
              .create_execution(NewExecution {
                group_id: group.id,
                dataset_hash: hash,
                fragment_prefix,
                inputs: candidate.datasets.dataset_refs(),
              })
              .await
              .map_err(Error::store)?;

            info!(
              provider = provider.slug(),
              diagnostic = diagnostic.slug(),
              group_key = %key,
              execution_id = execution.id,
              "enqueued execution"
            );

            outcome.planned.push(PlannedExecution {
              execution_id:    execution.id,
              group_id:        group.id,
              provider_slug:   provider.slug().to_string(),
              diagnostic_slug: diagnostic.slug().to_string(),
              definition:      ExecutionDefinition {
                key,
                datasets: candidate.datasets,
                output_directory: options
                  .scratch_root
                  .join(&execution.output_fragment),
                root_directory: options.scratch_root.clone(),
              },
            });
            outcome.summary.executions_created += 1;
            provider_executions += 1;
          }
        }
      }
    }
  }

  // Groups whose candidate vanished (datasets withdrawn) are flagged
  // stale, never deleted. Only meaningful for an unfiltered pass.
  if !options.dry_run
    && options.provider_filter.is_none()
    && options.diagnostic_filter.is_none()
  {
    let listed = store
      .list_groups(&GroupFilter::default())
      .await
      .map_err(Error::store)?;
    for entry in listed {
      let key = (entry.group.diagnostic_id, entry.group.group_key.canonical());
      if !entry.group.stale && !seen_groups.contains(&key) {
        info!(
          provider = %entry.provider_slug,
          diagnostic = %entry.diagnostic_slug,
          group_key = %entry.group.group_key,
          "flagging group stale; its candidate no longer resolves"
        );
        store
          .mark_group_stale(entry.group.id)
          .await
          .map_err(Error::store)?;
        outcome.summary.groups_flagged_stale += 1;
      }
    }
  }

  Ok(outcome)
}
