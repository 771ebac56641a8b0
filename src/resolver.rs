//! Identity resolution against an in-memory snapshot of the local registry.
//!
//! Strategies are tried in order, first decisive answer wins: the external-id
//! correlation is authoritative; the name strategy tolerates the portal and
//! the registry disagreeing on token order; more than one surviving candidate
//! is surfaced as ambiguous, never guessed among.

use crate::db::ClientRow;
use crate::model::{MatchResult, MatchStrategy, RemoteRecord};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct NameEntry {
    client_id: String,
    date_of_birth: Option<NaiveDate>,
}

/// Snapshot of all local clients, indexed for fast lookup during one run.
///
/// Built once per run and never refreshed: merges only add rows or fill
/// previously-empty fields, so keys computed at build time stay valid.
#[derive(Debug, Default)]
pub struct LocalIndex {
    by_external: HashMap<String, String>,
    by_name: HashMap<String, Vec<NameEntry>>,
}

/// Trim, fold runs of whitespace, lowercase.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl LocalIndex {
    pub fn build(clients: &[ClientRow]) -> Self {
        let mut index = LocalIndex::default();
        for client in clients {
            if let Some(external_id) = &client.external_id {
                index
                    .by_external
                    .insert(external_id.clone(), client.id.clone());
            }

            let entry = NameEntry {
                client_id: client.id.clone(),
                date_of_birth: client.date_of_birth,
            };
            let forward = normalize_name(&format!("{} {}", client.first_name, client.last_name));
            let reversed = normalize_name(&format!("{} {}", client.last_name, client.first_name));
            if forward.is_empty() {
                continue;
            }
            index
                .by_name
                .entry(forward.clone())
                .or_default()
                .push(entry.clone());
            if reversed != forward {
                index.by_name.entry(reversed).or_default().push(entry);
            }
        }
        index
    }

    /// Resolve one remote record to at most one local client.
    pub fn resolve(&self, record: &RemoteRecord) -> MatchResult {
        if let Some(client_id) = self.by_external.get(&record.remote_id) {
            return MatchResult::Matched {
                client_id: client_id.clone(),
                strategy: MatchStrategy::ExternalId,
            };
        }

        let key = normalize_name(&record.display_name);
        if key.is_empty() {
            return MatchResult::Unmatched;
        }
        let Some(entries) = self.by_name.get(&key) else {
            return MatchResult::Unmatched;
        };

        // Both token orders were indexed, so a client whose first and last
        // name coincide appears twice under the same key.
        let mut seen = HashSet::new();
        let mut candidates: Vec<&NameEntry> = entries
            .iter()
            .filter(|entry| seen.insert(entry.client_id.as_str()))
            .collect();

        // Dates of birth refine the match only when both sides carry one.
        candidates.retain(|entry| match (entry.date_of_birth, record.date_of_birth) {
            (Some(local), Some(remote)) => local == remote,
            _ => true,
        });

        match candidates.as_slice() {
            [] => MatchResult::Unmatched,
            [only] => MatchResult::Matched {
                client_id: only.client_id.clone(),
                strategy: MatchStrategy::Name,
            },
            _ => {
                let mut ids: Vec<String> = candidates
                    .iter()
                    .map(|entry| entry.client_id.clone())
                    .collect();
                ids.sort_unstable();
                MatchResult::Ambiguous { candidates: ids }
            }
        }
    }
}
