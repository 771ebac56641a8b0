//! Database row and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the resolver and merger.

use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Client slice loaded once per run to build the identity index.
#[derive(Debug, Clone)]
pub struct ClientRow {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub external_id: Option<String>,
}

/// Merge-relevant state of one client row, read inside the merge transaction.
#[derive(Debug, Clone, Default)]
pub struct ClientFieldState {
    pub external_id: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub visa_number: Option<String>,
    /// Current value of every mergeable text column.
    pub texts: BTreeMap<&'static str, Option<String>>,
    /// Current value of every flag column; `None` means never set.
    pub flags: BTreeMap<&'static str, Option<bool>>,
}

/// Natural key of one visit row within a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitKey {
    pub date: NaiveDate,
    pub fingerprint: String,
}

/// A value bound into a fill-empty UPDATE.
#[derive(Debug, Clone)]
pub enum ColumnValue {
    Text(String),
    Flag(bool),
    Date(NaiveDate),
}
