//! Differential merge of one remote snapshot into the local registry.
//!
//! Remote data is a supplement, never an overwrite: only currently-empty
//! columns are filled, flags move from NULL to a concrete value, and visit
//! rows are inserted only when their natural key is new. All writes for one
//! entity happen inside a single transaction.

use crate::db::{self, ColumnValue, Pool, VisitKey};
use crate::model::{MatchResult, MatchStrategy, MergeError, RemoteRecord};
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, Transaction};
use tracing::debug;
use uuid::Uuid;

/// What one merge transaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An existing client was supplemented.
    Filled {
        client_id: String,
        strategy: MatchStrategy,
        fields: Vec<String>,
        visits_inserted: u64,
    },
    /// A new client row was created for an unmatched record.
    Created {
        client_id: String,
        visits_inserted: u64,
    },
    /// Multiple candidates; nothing was written.
    Ambiguous { candidates: Vec<String> },
}

/// Fingerprint of a visit's notes for the natural key
/// `(client_id, visit_date, notes_fingerprint)`. Whitespace runs are folded
/// so re-rendered markup hashes identically.
pub fn notes_fingerprint(notes: &str) -> String {
    let normalized = notes.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// The portal lists people surname-first; the last token is the given name.
pub fn split_display_name(raw: &str) -> (String, String) {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    match tokens.as_slice() {
        [] => (String::new(), String::new()),
        [only] => ((*only).to_string(), String::new()),
        [rest @ .., first] => ((*first).to_string(), rest.join(" ")),
    }
}

/// Apply one resolved remote record to the datastore.
pub async fn apply(
    pool: &Pool,
    record: &RemoteRecord,
    resolution: &MatchResult,
) -> Result<MergeOutcome, MergeError> {
    match resolution {
        // Never guess among candidates: surfaced for manual resolution.
        MatchResult::Ambiguous { candidates } => Ok(MergeOutcome::Ambiguous {
            candidates: candidates.clone(),
        }),
        MatchResult::Matched {
            client_id,
            strategy,
        } => fill_existing(pool, record, client_id, *strategy).await,
        MatchResult::Unmatched => create_client(pool, record).await,
    }
}

async fn fill_existing(
    pool: &Pool,
    record: &RemoteRecord,
    client_id: &str,
    strategy: MatchStrategy,
) -> Result<MergeOutcome, MergeError> {
    let mut tx = pool.begin().await?;
    let state = db::client_field_state(&mut tx, client_id).await?;

    let mut sets: Vec<(&'static str, ColumnValue)> = Vec::new();
    if state.external_id.is_none() {
        sets.push(("external_id", ColumnValue::Text(record.remote_id.clone())));
    }
    if state.date_of_birth.is_none() {
        if let Some(date) = record.date_of_birth {
            sets.push(("date_of_birth", ColumnValue::Date(date)));
        }
    }
    if state.visa_number.is_none() {
        if let Some(visa) = &record.visa_number {
            sets.push(("visa_number", ColumnValue::Text(visa.clone())));
        }
    }
    for (column, value) in &record.fields {
        if is_empty_text(state.texts.get(column)) {
            sets.push((*column, ColumnValue::Text(value.clone())));
        }
    }
    for (column, value) in &record.flags {
        let never_set = state.flags.get(column).map_or(true, Option::is_none);
        if never_set {
            sets.push((*column, ColumnValue::Flag(*value)));
        }
    }

    let fields: Vec<String> = sets.iter().map(|(column, _)| column.to_string()).collect();
    db::fill_empty(&mut tx, client_id, &sets).await?;
    let visits_inserted = insert_new_visits(&mut tx, client_id, record).await?;
    tx.commit().await?;

    debug!(
        %client_id,
        filled = fields.len(),
        visits_inserted,
        "merged remote record into existing client"
    );
    Ok(MergeOutcome::Filled {
        client_id: client_id.to_string(),
        strategy,
        fields,
        visits_inserted,
    })
}

async fn create_client(pool: &Pool, record: &RemoteRecord) -> Result<MergeOutcome, MergeError> {
    let (first_name, last_name) = split_display_name(&record.display_name);
    let client_id = Uuid::new_v4().to_string();

    let mut tx = pool.begin().await?;
    db::insert_client(&mut tx, &client_id, &first_name, &last_name, record).await?;
    let visits_inserted = insert_new_visits(&mut tx, &client_id, record).await?;
    tx.commit().await?;

    debug!(%client_id, visits_inserted, "created client from unmatched remote record");
    Ok(MergeOutcome::Created {
        client_id,
        visits_inserted,
    })
}

async fn insert_new_visits(
    tx: &mut Transaction<'_, Sqlite>,
    client_id: &str,
    record: &RemoteRecord,
) -> Result<u64, MergeError> {
    if record.visits.is_empty() {
        return Ok(0);
    }
    let existing = db::visit_keys(tx, client_id).await?;
    let mut inserted = 0;
    for visit in &record.visits {
        let fingerprint = notes_fingerprint(&visit.notes);
        let key = VisitKey {
            date: visit.date,
            fingerprint: fingerprint.clone(),
        };
        if existing.contains(&key) {
            continue;
        }
        // OR IGNORE also catches duplicates within the record itself.
        inserted += db::insert_visit(tx, client_id, visit, &fingerprint).await?;
    }
    Ok(inserted)
}

fn is_empty_text(current: Option<&Option<String>>) -> bool {
    match current {
        Some(Some(value)) => value.trim().is_empty(),
        _ => true,
    }
}
