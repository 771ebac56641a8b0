//! Core domain types for a sync run: scraped remote snapshots, identity
//! resolution results, per-entity outcomes, the aggregate report, and the
//! error taxonomy.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Raw markup fetched from the portal. The engine never interprets it beyond
/// handing it to the parser and the signed-out heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub body: String,
}

impl RawPage {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// Which kind of value a portal field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Flag,
}

/// One entry of the portal-field → local-column mapping table.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// `name` attribute of the portal's form element.
    pub portal: &'static str,
    /// Local `clients` column the value merges into.
    pub column: &'static str,
    pub kind: FieldKind,
}

/// Fields readable from the portal's client edit form. The parser and the
/// merger both key off this one table, so adding a field is a single edit
/// (plus the column).
pub const FORM_FIELDS: &[FieldSpec] = &[
    FieldSpec { portal: "email", column: "email", kind: FieldKind::Text },
    FieldSpec { portal: "phone_cz", column: "czech_phone", kind: FieldKind::Text },
    FieldSpec { portal: "phone_ua", column: "ukrainian_phone", kind: FieldKind::Text },
    FieldSpec { portal: "street", column: "street", kind: FieldKind::Text },
    FieldSpec { portal: "city_full", column: "city", kind: FieldKind::Text },
    FieldSpec { portal: "city_of_origin", column: "origin_city", kind: FieldKind::Text },
    FieldSpec { portal: "insurance", column: "insurance", kind: FieldKind::Text },
    FieldSpec { portal: "education", column: "education", kind: FieldKind::Text },
    FieldSpec { portal: "profession", column: "profession", kind: FieldKind::Text },
    FieldSpec { portal: "hobbies", column: "hobbies", kind: FieldKind::Text },
    FieldSpec { portal: "note_volunteer", column: "volunteer_notes", kind: FieldKind::Text },
    FieldSpec { portal: "volunteer_text", column: "volunteer_skills", kind: FieldKind::Text },
    FieldSpec { portal: "text_help", column: "help_needed", kind: FieldKind::Text },
    FieldSpec { portal: "note", column: "notes", kind: FieldKind::Text },
    FieldSpec { portal: "free_housing", column: "free_housing", kind: FieldKind::Flag },
    FieldSpec { portal: "job", column: "has_work", kind: FieldKind::Flag },
    FieldSpec { portal: "search_job", column: "needs_job_help", kind: FieldKind::Flag },
    FieldSpec { portal: "volunteer", column: "volunteer_interest", kind: FieldKind::Flag },
    FieldSpec { portal: "in_ua", column: "went_back_ukraine", kind: FieldKind::Flag },
];

/// `label: value` pairs in the detail page's summary blocks, keyed by the
/// portal's own captions. The form value wins when a field appears in both.
pub const LABEL_FIELDS: &[(&str, &str)] = &[
    ("Email:", "email"),
    ("Телефон CZ:", "czech_phone"),
    ("Телефон UA:", "ukrainian_phone"),
    ("Город:", "city"),
    ("Улица:", "street"),
    ("Тип визы:", "visa_type"),
    ("Дата приезда в чехию:", "arrival_date"),
];

/// Every text column the merger may fill.
pub const TEXT_COLUMNS: &[&str] = &[
    "email",
    "czech_phone",
    "ukrainian_phone",
    "street",
    "city",
    "origin_city",
    "insurance",
    "education",
    "profession",
    "hobbies",
    "volunteer_notes",
    "volunteer_skills",
    "help_needed",
    "notes",
    "visa_type",
    "arrival_date",
];

/// Every boolean column. Flags move from NULL to a concrete value, never flip.
pub const FLAG_COLUMNS: &[&str] = &[
    "free_housing",
    "has_work",
    "needs_job_help",
    "volunteer_interest",
    "went_back_ukraine",
];

/// One row of a portal entity's visit history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVisit {
    pub date: NaiveDate,
    pub reason_tags: Vec<String>,
    pub notes: String,
    pub duration_minutes: Option<i64>,
}

/// One scraped snapshot of a portal entity's detail page. Immutable once
/// constructed; produced fresh on every fetch.
///
/// `fields` and `flags` are keyed by the local column name (resolved through
/// the mapping tables at parse time); a missing key means the page carried no
/// usable value for that field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub display_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub visa_number: Option<String>,
    pub fields: BTreeMap<&'static str, String>,
    pub flags: BTreeMap<&'static str, bool>,
    pub visits: Vec<RemoteVisit>,
}

impl RemoteRecord {
    pub fn new(remote_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            display_name: display_name.into(),
            date_of_birth: None,
            visa_number: None,
            fields: BTreeMap::new(),
            flags: BTreeMap::new(),
            visits: Vec::new(),
        }
    }
}

/// Which strategy produced an identity match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExternalId,
    Name,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExternalId => "external_id",
            MatchStrategy::Name => "name",
        }
    }
}

/// Result of resolving one remote record against the local index. Computed
/// per run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched {
        client_id: String,
        strategy: MatchStrategy,
    },
    Ambiguous {
        candidates: Vec<String>,
    },
    Unmatched,
}

/// Non-fatal extraction problem, recorded per field or row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub context: String,
    pub message: String,
}

impl ParseWarning {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

/// Terminal result for one processed remote entity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EntityOutcome {
    /// Matched an existing client; empty fields filled, new visits inserted.
    Merged {
        remote_id: String,
        client_id: String,
        strategy: MatchStrategy,
        fields_filled: Vec<String>,
        visits_inserted: u64,
    },
    /// No local candidate; a new client row was created.
    Created {
        remote_id: String,
        client_id: String,
        visits_inserted: u64,
    },
    /// More than one equally-valid candidate; nothing was written.
    Ambiguous {
        remote_id: String,
        candidates: Vec<String>,
    },
    /// Not processed (run was cancelled before this entity's fetch).
    Skipped { remote_id: String },
    Failed { remote_id: String, reason: String },
}

/// Aggregate result of one sync run; the only output besides the datastore
/// mutations.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub fetched: u64,
    pub matched: u64,
    pub created: u64,
    pub ambiguous: u64,
    pub skipped: u64,
    pub errors: u64,
    pub visits_inserted: u64,
    pub parse_warnings: u64,
    /// How many times each column was filled, across all merged entities.
    pub fields_filled: BTreeMap<String, u64>,
    pub outcomes: Vec<EntityOutcome>,
}

impl SyncReport {
    /// Fold one entity outcome into the aggregate counters.
    pub fn absorb(&mut self, outcome: EntityOutcome) {
        match &outcome {
            EntityOutcome::Merged {
                fields_filled,
                visits_inserted,
                ..
            } => {
                self.matched += 1;
                self.visits_inserted += visits_inserted;
                for field in fields_filled {
                    *self.fields_filled.entry(field.clone()).or_insert(0) += 1;
                }
            }
            EntityOutcome::Created {
                visits_inserted, ..
            } => {
                self.created += 1;
                self.visits_inserted += visits_inserted;
            }
            EntityOutcome::Ambiguous { .. } => self.ambiguous += 1,
            EntityOutcome::Skipped { .. } => self.skipped += 1,
            EntityOutcome::Failed { .. } => self.errors += 1,
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("portal rejected the credentials")]
    Rejected,
    #[error("portal unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("session expired (response looks like the sign-in page)")]
    SessionExpired,
    #[error("unexpected HTTP status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("datastore error: {0}")]
    Db(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_tables_are_consistent() {
        for spec in FORM_FIELDS {
            match spec.kind {
                FieldKind::Text => assert!(
                    TEXT_COLUMNS.contains(&spec.column),
                    "form field {} maps to unknown text column {}",
                    spec.portal,
                    spec.column
                ),
                FieldKind::Flag => assert!(
                    FLAG_COLUMNS.contains(&spec.column),
                    "form field {} maps to unknown flag column {}",
                    spec.portal,
                    spec.column
                ),
            }
        }
        for (label, column) in LABEL_FIELDS {
            assert!(
                TEXT_COLUMNS.contains(column),
                "label {label} maps to unknown column {column}"
            );
        }
    }

    #[test]
    fn mapping_tables_have_no_duplicates() {
        let mut portals: Vec<&str> = FORM_FIELDS.iter().map(|s| s.portal).collect();
        portals.sort_unstable();
        portals.dedup();
        assert_eq!(portals.len(), FORM_FIELDS.len());

        let mut columns: Vec<&str> = TEXT_COLUMNS.iter().chain(FLAG_COLUMNS).copied().collect();
        columns.sort_unstable();
        columns.dedup();
        assert_eq!(columns.len(), TEXT_COLUMNS.len() + FLAG_COLUMNS.len());
    }

    #[test]
    fn report_absorb_counts_outcomes() {
        let mut report = SyncReport::default();
        report.absorb(EntityOutcome::Merged {
            remote_id: "10".into(),
            client_id: "a".into(),
            strategy: MatchStrategy::Name,
            fields_filled: vec!["email".into(), "city".into()],
            visits_inserted: 2,
        });
        report.absorb(EntityOutcome::Ambiguous {
            remote_id: "11".into(),
            candidates: vec!["b".into(), "c".into()],
        });
        report.absorb(EntityOutcome::Failed {
            remote_id: "12".into(),
            reason: "boom".into(),
        });

        assert_eq!(report.matched, 1);
        assert_eq!(report.ambiguous, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.visits_inserted, 2);
        assert_eq!(report.fields_filled.get("email"), Some(&1));
        assert_eq!(report.outcomes.len(), 3);
    }
}
