//! Schema migrations, applied on every database open.
//!
//! Each entry in [`MIGRATIONS`] moves the schema up one `user_version`
//! step; the pragma guard makes re-opens cheap and upgrades exact.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// All migrations in order. The target `user_version` of each step is its
/// index plus one; append here whenever the schema changes.
const MIGRATIONS: &[(&str, Migration)] = &[("v001_initial", v001_initial::up)];

/// Bring the connection's schema up to date.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = MIGRATIONS.len() as u32;

    if current >= target {
        tracing::debug!(version = current, "database schema is current");
        return Ok(());
    }

    for (step, (name, migrate)) in MIGRATIONS.iter().enumerate() {
        let version = step as u32 + 1;
        if current >= version {
            continue;
        }
        tracing::info!(migration = name, version, "applying database migration");
        migrate(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
