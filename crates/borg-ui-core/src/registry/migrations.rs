use redb::{Database, ReadableTable, WriteTransaction};

use crate::error::Result;

use super::db::{reg_err, JOBS, META, MOUNTS, SCHEDULES, USERS};

/// `META` key holding the applied schema version.
pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u64,
    description: &'static str,
    apply: fn(&WriteTransaction) -> Result<()>,
}

/// Ordered schema history. Append only; never renumber.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create job, mount and schedule tables",
        apply: create_core_tables,
    },
    Migration {
        version: 2,
        description: "create users table",
        apply: create_users_table,
    },
];

pub const LATEST_SCHEMA_VERSION: u64 = 2;

fn create_core_tables(wt: &WriteTransaction) -> Result<()> {
    wt.open_table(JOBS).map_err(reg_err)?;
    wt.open_table(MOUNTS).map_err(reg_err)?;
    wt.open_table(SCHEDULES).map_err(reg_err)?;
    Ok(())
}

fn create_users_table(wt: &WriteTransaction) -> Result<()> {
    wt.open_table(USERS).map_err(reg_err)?;
    Ok(())
}

fn current_version(wt: &WriteTransaction) -> Result<u64> {
    let table = wt.open_table(META).map_err(reg_err)?;
    let version = table
        .get(SCHEMA_VERSION_KEY)
        .map_err(reg_err)?
        .map(|v| v.value())
        .unwrap_or(0);
    Ok(version)
}

/// Apply every migration newer than the stored schema version.
///
/// Each migration commits in its own transaction together with the version
/// bump, so an interrupted run resumes where it stopped. Returns how many
/// migrations were applied.
pub fn apply_migrations(db: &Database) -> Result<u32> {
    let mut applied = 0u32;
    for migration in MIGRATIONS {
        let wt = db.begin_write().map_err(reg_err)?;
        if current_version(&wt)? >= migration.version {
            wt.abort().map_err(reg_err)?;
            continue;
        }
        (migration.apply)(&wt)?;
        {
            let mut meta = wt.open_table(META).map_err(reg_err)?;
            meta.insert(SCHEMA_VERSION_KEY, migration.version)
                .map_err(reg_err)?;
        }
        wt.commit().map_err(reg_err)?;
        tracing::info!(
            version = migration.version,
            "applied migration: {}",
            migration.description
        );
        applied += 1;
    }
    Ok(applied)
}

/// The schema version recorded in `db`, or 0 for a fresh database.
pub fn schema_version(db: &Database) -> Result<u64> {
    let wt = db.begin_write().map_err(reg_err)?;
    let version = current_version(&wt)?;
    wt.abort().map_err(reg_err)?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_database_gets_every_migration() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("r.redb")).unwrap();
        assert_eq!(schema_version(&db).unwrap(), 0);

        let applied = apply_migrations(&db).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(schema_version(&db).unwrap(), LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn rerun_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("r.redb")).unwrap();
        apply_migrations(&db).unwrap();
        assert_eq!(apply_migrations(&db).unwrap(), 0);
    }

    #[test]
    fn latest_version_matches_history() {
        assert_eq!(
            MIGRATIONS.last().map(|m| m.version),
            Some(LATEST_SCHEMA_VERSION)
        );
    }
}
