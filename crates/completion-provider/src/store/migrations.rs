//! Ordered, reversible schema migrations
//!
//! The index of the last applied migration lives in the `meta` table under
//! `current_migration_index`. A missing key means no migration is applied.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

const INDEX_KEY: &str = "current_migration_index";

pub struct Migration {
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    name: "000_create_jobs",
    up: MIGRATION_000_UP,
    down: MIGRATION_000_DOWN,
}];

const MIGRATION_000_UP: &str = r#"
CREATE TABLE jobs (
    rowid INTEGER PRIMARY KEY,
    provider_peer_id TEXT NOT NULL,
    provider_job_id TEXT NOT NULL,
    input TEXT NOT NULL,
    streaming INTEGER NOT NULL CHECK(streaming IN (0, 1)),
    output TEXT,
    balance_delta TEXT,
    public_payload TEXT,
    service_error TEXT,
    completed_at_sync INTEGER,
    CHECK(output IS NULL OR service_error IS NULL)
);

CREATE UNIQUE INDEX idx_jobs_external_id ON jobs(provider_peer_id, provider_job_id);
"#;

const MIGRATION_000_DOWN: &str = r#"
DROP INDEX idx_jobs_external_id;
DROP TABLE jobs;
"#;

/// Index of the newest migration
pub fn latest_index() -> usize {
    MIGRATIONS.len() - 1
}

fn ensure_meta(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Index of the last applied migration, if any
pub fn current_index(conn: &Connection) -> Result<Option<usize>> {
    ensure_meta(conn)?;
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [INDEX_KEY], |row| {
            row.get(0)
        })
        .optional()?;

    value
        .map(|v| {
            v.parse::<usize>()
                .with_context(|| format!("Corrupt {} value {:?}", INDEX_KEY, v))
        })
        .transpose()
}

fn set_index(tx: &Transaction<'_>, index: Option<usize>) -> Result<()> {
    match index {
        Some(index) => tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![INDEX_KEY, index.to_string()],
        )?,
        None => tx.execute("DELETE FROM meta WHERE key = ?1", [INDEX_KEY])?,
    };
    Ok(())
}

/// Migrate up or down until `target` is the last applied migration.
///
/// `None` reverts every migration. Each step runs in its own transaction.
pub fn migrate_to(conn: &mut Connection, target: Option<usize>) -> Result<()> {
    if target.is_some_and(|t| t >= MIGRATIONS.len()) {
        bail!("Unknown migration index {:?}", target);
    }

    let mut current = current_index(conn)?;
    if let Some(index) = current.filter(|&i| i >= MIGRATIONS.len()) {
        bail!("Database is at migration {} which this build does not know", index);
    }

    // Up
    while current < target {
        let next = current.map_or(0, |i| i + 1);
        let migration = &MIGRATIONS[next];
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)
            .with_context(|| format!("Migration {} failed", migration.name))?;
        set_index(&tx, Some(next))?;
        tx.commit()?;
        tracing::info!("Applied migration: {}", migration.name);
        current = Some(next);
    }

    // Down
    while current > target {
        let Some(index) = current else { break };
        let migration = &MIGRATIONS[index];
        let tx = conn.transaction()?;
        tx.execute_batch(migration.down)
            .with_context(|| format!("Reverting migration {} failed", migration.name))?;
        let previous = index.checked_sub(1);
        set_index(&tx, previous)?;
        tx.commit()?;
        tracing::info!("Reverted migration: {}", migration.name);
        current = previous;
    }

    Ok(())
}
