use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in order; entry `n` upgrades `user_version` from `n` to
/// `n + 1`.
const SCHEMAS: &[&str] = &[include_str!("schemas/schema_v1.sql")];

const CURRENT_SCHEMA_VERSION: i32 = SCHEMAS.len() as i32;

/// Brings the store up to [`CURRENT_SCHEMA_VERSION`] in one transaction.
/// A store written by a newer build is refused rather than downgraded.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!("store version {version} is newer than supported schema {CURRENT_SCHEMA_VERSION}");
    }

    let pending = SCHEMAS.get(version.max(0) as usize..).unwrap_or_default();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (offset, script) in pending.iter().enumerate() {
        let target = version + offset as i32 + 1;
        tx.execute_batch(script)
            .with_context(|| format!("migration to schema v{target} failed"))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")
}
