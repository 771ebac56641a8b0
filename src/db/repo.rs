use super::model::{ClientFieldState, ClientRow, ColumnValue, VisitKey};
use crate::model::{RemoteRecord, RemoteVisit, FLAG_COLUMNS, TEXT_COLUMNS};
use anyhow::Result;
use once_cell::sync::Lazy;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Full client read for the run's identity index. Called once per run; the
/// index is never refreshed mid-run.
#[instrument(skip_all)]
pub async fn load_clients(pool: &Pool) -> Result<Vec<ClientRow>> {
    let rows = sqlx::query(
        "SELECT id, first_name, last_name, date_of_birth, external_id FROM clients",
    )
    .fetch_all(pool)
    .await?;

    let mut clients = Vec::with_capacity(rows.len());
    for row in rows {
        clients.push(ClientRow {
            id: row.get("id"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            date_of_birth: row.try_get("date_of_birth")?,
            external_id: row.try_get("external_id")?,
        });
    }
    Ok(clients)
}

static FIELD_STATE_SQL: Lazy<String> = Lazy::new(|| {
    let mut cols: Vec<&str> = vec!["external_id", "date_of_birth", "visa_number"];
    cols.extend_from_slice(TEXT_COLUMNS);
    cols.extend_from_slice(FLAG_COLUMNS);
    format!("SELECT {} FROM clients WHERE id = ?", cols.join(", "))
});

/// Current values of every mergeable column for one client.
#[instrument(skip_all)]
pub async fn client_field_state(
    tx: &mut Transaction<'_, Sqlite>,
    client_id: &str,
) -> Result<ClientFieldState, sqlx::Error> {
    let row = sqlx::query(FIELD_STATE_SQL.as_str())
        .bind(client_id)
        .fetch_one(&mut **tx)
        .await?;

    let mut state = ClientFieldState {
        external_id: row.try_get("external_id")?,
        date_of_birth: row.try_get("date_of_birth")?,
        visa_number: row.try_get("visa_number")?,
        ..Default::default()
    };
    for col in TEXT_COLUMNS {
        state.texts.insert(*col, row.try_get(*col)?);
    }
    for col in FLAG_COLUMNS {
        state.flags.insert(*col, row.try_get(*col)?);
    }
    Ok(state)
}

/// Applies the computed fill-empty assignments in one UPDATE. Column names
/// come from the static mapping tables, never from remote input.
#[instrument(skip_all)]
pub async fn fill_empty(
    tx: &mut Transaction<'_, Sqlite>,
    client_id: &str,
    sets: &[(&'static str, ColumnValue)],
) -> Result<u64, sqlx::Error> {
    if sets.is_empty() {
        return Ok(0);
    }
    let assignments = sets
        .iter()
        .map(|(col, _)| format!("{col} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE clients SET {assignments}, updated_at = CURRENT_TIMESTAMP WHERE id = ?"
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in sets {
        query = match value {
            ColumnValue::Text(v) => query.bind(v.clone()),
            ColumnValue::Flag(v) => query.bind(*v),
            ColumnValue::Date(v) => query.bind(*v),
        };
    }
    let result = query.bind(client_id).execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

static INSERT_CLIENT_SQL: Lazy<String> = Lazy::new(|| {
    let mut cols: Vec<&str> = vec![
        "id",
        "first_name",
        "last_name",
        "date_of_birth",
        "external_id",
        "visa_number",
    ];
    cols.extend_from_slice(TEXT_COLUMNS);
    cols.extend_from_slice(FLAG_COLUMNS);
    let placeholders = vec!["?"; cols.len()].join(", ");
    format!(
        "INSERT INTO clients ({}) VALUES ({placeholders})",
        cols.join(", ")
    )
});

/// Inserts a fully-populated client row for an unmatched remote record,
/// carrying the remote id as its external correlation key.
#[instrument(skip_all)]
pub async fn insert_client(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    first_name: &str,
    last_name: &str,
    record: &RemoteRecord,
) -> Result<(), sqlx::Error> {
    let mut query = sqlx::query(INSERT_CLIENT_SQL.as_str())
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .bind(record.date_of_birth)
        .bind(&record.remote_id)
        .bind(&record.visa_number);
    for col in TEXT_COLUMNS {
        query = query.bind(record.fields.get(col).cloned());
    }
    for col in FLAG_COLUMNS {
        query = query.bind(record.flags.get(col).copied());
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

/// Natural keys of every visit already stored for a client.
#[instrument(skip_all)]
pub async fn visit_keys(
    tx: &mut Transaction<'_, Sqlite>,
    client_id: &str,
) -> Result<HashSet<VisitKey>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT visit_date, notes_fingerprint FROM visits WHERE client_id = ?",
    )
    .bind(client_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut keys = HashSet::with_capacity(rows.len());
    for row in rows {
        keys.insert(VisitKey {
            date: row.try_get("visit_date")?,
            fingerprint: row.get("notes_fingerprint"),
        });
    }
    Ok(keys)
}

/// Inserts one visit row, ignoring natural-key duplicates. Returns the number
/// of rows actually written (0 when the key already existed).
#[instrument(skip_all)]
pub async fn insert_visit(
    tx: &mut Transaction<'_, Sqlite>,
    client_id: &str,
    visit: &RemoteVisit,
    fingerprint: &str,
) -> Result<u64, sqlx::Error> {
    let reason = if visit.reason_tags.is_empty() {
        None
    } else {
        Some(visit.reason_tags.join(", "))
    };
    let result = sqlx::query(
        "INSERT OR IGNORE INTO visits \
         (id, client_id, visit_date, duration_minutes, reason, notes, notes_fingerprint) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(client_id)
    .bind(visit.date)
    .bind(visit.duration_minutes)
    .bind(reason)
    .bind(&visit.notes)
    .bind(fingerprint)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn setup_pool() -> Pool {
        // Single connection so the whole test shares one in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_record() -> RemoteRecord {
        let mut record = RemoteRecord::new("77", "Novak Jan");
        record.date_of_birth = NaiveDate::from_ymd_opt(1990, 5, 1);
        record.fields.insert("email", "jan@example.org".into());
        record.flags.insert("free_housing", true);
        record
    }

    #[tokio::test]
    async fn insert_and_load_roundtrip() {
        let pool = setup_pool().await;
        let record = sample_record();

        let mut tx = pool.begin().await.unwrap();
        insert_client(&mut tx, "c-1", "Jan", "Novak", &record)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let clients = load_clients(&pool).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].external_id.as_deref(), Some("77"));
        assert_eq!(clients[0].first_name, "Jan");

        let mut tx = pool.begin().await.unwrap();
        let state = client_field_state(&mut tx, "c-1").await.unwrap();
        assert_eq!(state.texts["email"].as_deref(), Some("jan@example.org"));
        assert_eq!(state.flags["free_housing"], Some(true));
        assert_eq!(state.flags["has_work"], None);
    }

    #[tokio::test]
    async fn fill_empty_updates_listed_columns_only() {
        let pool = setup_pool().await;
        let record = sample_record();
        let mut tx = pool.begin().await.unwrap();
        insert_client(&mut tx, "c-1", "Jan", "Novak", &record)
            .await
            .unwrap();
        fill_empty(
            &mut tx,
            "c-1",
            &[
                ("city", ColumnValue::Text("Praha".into())),
                ("has_work", ColumnValue::Flag(false)),
            ],
        )
        .await
        .unwrap();
        let state = client_field_state(&mut tx, "c-1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(state.texts["city"].as_deref(), Some("Praha"));
        assert_eq!(state.flags["has_work"], Some(false));
        // untouched column stays as inserted
        assert_eq!(state.texts["email"].as_deref(), Some("jan@example.org"));
    }

    #[tokio::test]
    async fn duplicate_visit_key_is_ignored() {
        let pool = setup_pool().await;
        let record = sample_record();
        let visit = RemoteVisit {
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            reason_tags: vec!["consultation".into()],
            notes: "first visit".into(),
            duration_minutes: Some(30),
        };

        let mut tx = pool.begin().await.unwrap();
        insert_client(&mut tx, "c-1", "Jan", "Novak", &record)
            .await
            .unwrap();
        assert_eq!(insert_visit(&mut tx, "c-1", &visit, "fp-1").await.unwrap(), 1);
        assert_eq!(insert_visit(&mut tx, "c-1", &visit, "fp-1").await.unwrap(), 0);
        let keys = visit_keys(&mut tx, "c-1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&VisitKey {
            date: visit.date,
            fingerprint: "fp-1".into(),
        }));
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(
            prepare_sqlite_url("sqlite::memory:"),
            "sqlite::memory:".to_string()
        );
        assert_eq!(
            prepare_sqlite_url("postgres://x"),
            "postgres://x".to_string()
        );
        assert!(prepare_sqlite_url("sqlite://tmp/reg.db").starts_with("sqlite://"));
    }
}
