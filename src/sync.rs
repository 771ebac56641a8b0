//! End-to-end run coordination: authenticate, fetch the entity listing, then
//! for every remote id run gate → fetch → parse → resolve → merge, streaming
//! per-entity outcomes into one [`SyncReport`].
//!
//! A run never throws away partial progress: every failure past the initial
//! authentication is isolated to its entity and surfaced in the report.

use crate::db::{self, Pool};
use crate::gate::ConcurrencyGate;
use crate::merge::{self, MergeOutcome};
use crate::model::{AuthError, EntityOutcome, FetchError, MergeError, RawPage, SyncReport};
use crate::parser::{self, ListedEntity};
use crate::portal::Portal;
use crate::resolver::LocalIndex;
use anyhow::{Context, Result};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Anything that can sink one entity's pipeline.
#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("re-authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

struct TaskResult {
    outcome: EntityOutcome,
    warnings: u64,
    fetched: bool,
}

impl TaskResult {
    fn skipped(remote_id: String) -> Self {
        Self {
            outcome: EntityOutcome::Skipped { remote_id },
            warnings: 0,
            fetched: false,
        }
    }

    fn failed(remote_id: String, err: &TaskError, fetched: bool) -> Self {
        Self {
            outcome: EntityOutcome::Failed {
                remote_id,
                reason: err.to_string(),
            },
            warnings: 0,
            fetched,
        }
    }
}

pub struct Orchestrator {
    portal: Arc<dyn Portal>,
    pool: Pool,
    gate: ConcurrencyGate,
    cancel: CancellationToken,
    limit: Option<usize>,
    /// Re-auth generation counter. Tasks racing on the same session expiry
    /// serialize here; whoever wins logs in once, the rest observe the bumped
    /// generation and skip the duplicate login.
    reauth: Arc<Mutex<u64>>,
}

impl Orchestrator {
    pub fn new(
        portal: Arc<dyn Portal>,
        pool: Pool,
        gate: ConcurrencyGate,
        cancel: CancellationToken,
        limit: Option<usize>,
    ) -> Self {
        Self {
            portal,
            pool,
            gate,
            cancel,
            limit,
            reauth: Arc::new(Mutex::new(0)),
        }
    }

    /// Drive one full sync run.
    pub async fn run(&self) -> Result<SyncReport> {
        let clients = db::load_clients(&self.pool)
            .await
            .context("failed to load local clients")?;
        let index = Arc::new(LocalIndex::build(&clients));
        info!(clients = clients.len(), "local identity index built");

        // A rejected or unreachable login at run start is fatal.
        self.portal
            .authenticate()
            .await
            .context("portal authentication failed")?;

        let listing = {
            let _permit = self.gate.acquire().await;
            fetch_listing_with_reauth(self.portal.as_ref(), &self.reauth)
                .await
                .map_err(|err| anyhow::anyhow!("failed to fetch entity listing: {err}"))?
        };
        let mut entities = parser::parse_listing(&listing)?;
        info!(entities = entities.len(), "remote listing fetched");
        if let Some(limit) = self.limit {
            entities.truncate(limit);
            info!(limit, "limited test run");
        }

        let mut tasks = Vec::with_capacity(entities.len());
        for entity in entities {
            let portal = Arc::clone(&self.portal);
            let pool = self.pool.clone();
            let gate = self.gate.clone();
            let cancel = self.cancel.clone();
            let index = Arc::clone(&index);
            let reauth = Arc::clone(&self.reauth);
            tasks.push(tokio::spawn(async move {
                process_entity(portal, pool, gate, cancel, index, reauth, entity).await
            }));
        }

        let mut report = SyncReport::default();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => {
                    if result.fetched {
                        report.fetched += 1;
                    }
                    report.parse_warnings += result.warnings;
                    report.absorb(result.outcome);
                }
                Err(err) => {
                    error!(?err, "entity task aborted");
                    report.errors += 1;
                }
            }
        }

        info!(
            fetched = report.fetched,
            matched = report.matched,
            created = report.created,
            ambiguous = report.ambiguous,
            skipped = report.skipped,
            errors = report.errors,
            visits_inserted = report.visits_inserted,
            "sync run complete"
        );
        Ok(report)
    }
}

async fn process_entity(
    portal: Arc<dyn Portal>,
    pool: Pool,
    gate: ConcurrencyGate,
    cancel: CancellationToken,
    index: Arc<LocalIndex>,
    reauth: Arc<Mutex<u64>>,
    entity: ListedEntity,
) -> TaskResult {
    let remote_id = entity.remote_id.clone();

    // Cancellation stops scheduling new fetches; entities already past the
    // gate run to the end of their transaction.
    let page = tokio::select! {
        biased;
        _ = cancel.cancelled() => return TaskResult::skipped(remote_id),
        permit = gate.acquire() => {
            let fetched = fetch_detail_with_reauth(portal.as_ref(), &reauth, &remote_id).await;
            drop(permit);
            match fetched {
                Ok(page) => page,
                Err(err) => {
                    warn!(%remote_id, %err, "entity fetch failed");
                    return TaskResult::failed(remote_id, &err, false);
                }
            }
        }
    };

    let parsed = parser::parse_detail(&remote_id, &entity.display_name, &page);
    for warning in &parsed.warnings {
        warn!(%remote_id, "{warning}");
    }

    let resolution = index.resolve(&parsed.record);
    let outcome = match merge::apply(&pool, &parsed.record, &resolution).await {
        Ok(MergeOutcome::Filled {
            client_id,
            strategy,
            fields,
            visits_inserted,
        }) => EntityOutcome::Merged {
            remote_id,
            client_id,
            strategy,
            fields_filled: fields,
            visits_inserted,
        },
        Ok(MergeOutcome::Created {
            client_id,
            visits_inserted,
        }) => EntityOutcome::Created {
            remote_id,
            client_id,
            visits_inserted,
        },
        Ok(MergeOutcome::Ambiguous { candidates }) => {
            warn!(%remote_id, ?candidates, "ambiguous identity, left for manual resolution");
            EntityOutcome::Ambiguous {
                remote_id,
                candidates,
            }
        }
        Err(err) => {
            warn!(%remote_id, %err, "merge transaction failed");
            EntityOutcome::Failed {
                remote_id,
                reason: TaskError::from(err).to_string(),
            }
        }
    };

    TaskResult {
        outcome,
        warnings: parsed.warnings.len() as u64,
        fetched: true,
    }
}

/// Fetch one detail page, recovering from a stale session exactly once.
async fn fetch_detail_with_reauth(
    portal: &dyn Portal,
    reauth: &Mutex<u64>,
    remote_id: &str,
) -> Result<RawPage, TaskError> {
    let seen = *reauth.lock().await;
    match portal.fetch_detail(remote_id).await {
        Err(FetchError::SessionExpired) => {
            reauthenticate(portal, reauth, seen).await?;
            // One retry after a fresh login; a second expiry is a real failure.
            Ok(portal.fetch_detail(remote_id).await?)
        }
        other => Ok(other?),
    }
}

/// Same recovery for the enumeration page, which is gated like any fetch.
async fn fetch_listing_with_reauth(
    portal: &dyn Portal,
    reauth: &Mutex<u64>,
) -> Result<RawPage, TaskError> {
    let seen = *reauth.lock().await;
    match portal.fetch_listing().await {
        Err(FetchError::SessionExpired) => {
            reauthenticate(portal, reauth, seen).await?;
            Ok(portal.fetch_listing().await?)
        }
        other => Ok(other?),
    }
}

/// Serialized re-authentication: only one login is in flight at a time, and a
/// task that waited behind it does not trigger a second one.
async fn reauthenticate(
    portal: &dyn Portal,
    reauth: &Mutex<u64>,
    seen: u64,
) -> Result<(), AuthError> {
    let mut generation = reauth.lock().await;
    if *generation != seen {
        // Someone else re-authenticated while we waited for the lock.
        return Ok(());
    }
    warn!("session expired, re-authenticating");
    portal.authenticate().await?;
    *generation += 1;
    Ok(())
}
