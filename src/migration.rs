use crate::pool::Pool;
use anyhow::{Context, Result};
use surrealdb::{engine::any::Any, Surreal};
use tracing::{info, warn};

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_visit_table",
        up: r#"
            DEFINE TABLE IF NOT EXISTS visit SCHEMAFULL;
            DEFINE FIELD IF NOT EXISTS first_name ON TABLE visit TYPE option<string>;
            DEFINE FIELD IF NOT EXISTS last_name ON TABLE visit TYPE option<string>;
            DEFINE FIELD IF NOT EXISTS created_at ON TABLE visit TYPE datetime DEFAULT time::now();
            DEFINE FIELD IF NOT EXISTS updated_at ON TABLE visit TYPE datetime DEFAULT time::now();
        "#,
        down: r#"
            REMOVE TABLE IF EXISTS visit;
        "#,
    },
    Migration {
        version: 2,
        name: "create_visit_counter",
        up: r#"
            DEFINE TABLE IF NOT EXISTS visit_counter SCHEMAFULL;
            DEFINE FIELD IF NOT EXISTS value ON TABLE visit_counter TYPE int DEFAULT 0;
            UPSERT visit_counter:visit SET value = value ?? 0;
        "#,
        down: r#"
            REMOVE TABLE IF EXISTS visit_counter;
        "#,
    },
];

const TRACKING_TABLE: &str = r#"
    DEFINE TABLE IF NOT EXISTS migration SCHEMAFULL;
    DEFINE FIELD IF NOT EXISTS version ON TABLE migration TYPE int;
    DEFINE FIELD IF NOT EXISTS name ON TABLE migration TYPE string;
    DEFINE FIELD IF NOT EXISTS applied_at ON TABLE migration TYPE datetime;
    DEFINE INDEX IF NOT EXISTS idx_migration_version ON TABLE migration COLUMNS version UNIQUE;
"#;

/// Migrations above `current`, oldest first
pub fn pending(current: u32) -> Vec<&'static Migration> {
    MIGRATIONS.iter().filter(|m| m.version > current).collect()
}

/// Migrations to undo to get from `current` down to `target`, newest first
pub fn to_rollback(current: u32, target: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.version > target && m.version <= current)
        .rev()
        .collect()
}

async fn current_version(db: &Surreal<Any>) -> Result<u32> {
    let mut response = db
        .query("SELECT VALUE version FROM migration ORDER BY version DESC LIMIT 1")
        .await?;
    let current: Option<u32> = response.take(0)?;
    Ok(current.unwrap_or(0))
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    info!("Running database migrations...");

    let db = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))?;

    db.query(TRACKING_TABLE).await?.check()?;

    let current = current_version(&db).await?;
    info!("Current migration version: {}", current);

    let pending = pending(current);
    if pending.is_empty() {
        info!("No pending migrations");
        return Ok(());
    }

    for migration in pending {
        info!("Applying migration {}: {}", migration.version, migration.name);

        // Schema change and bookkeeping commit or fail together
        let statement = format!(
            "BEGIN TRANSACTION;\n{}\nCREATE migration CONTENT {{ version: $version, name: $name, applied_at: time::now() }};\nCOMMIT TRANSACTION;",
            migration.up
        );

        db.query(statement)
            .bind(("version", migration.version))
            .bind(("name", migration.name.to_string()))
            .await
            .and_then(|response| response.check())
            .with_context(|| format!("Failed to apply migration {}", migration.version))?;

        info!("Migration {} applied successfully", migration.version);
    }

    info!("All migrations completed successfully");
    Ok(())
}

pub async fn rollback_migration(pool: &Pool, target_version: u32) -> Result<()> {
    let db = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))?;

    db.query(TRACKING_TABLE).await?.check()?;
    let current = current_version(&db).await?;

    if target_version >= current {
        warn!(
            "Target version {} is not less than current version {}",
            target_version, current
        );
        return Ok(());
    }

    for migration in to_rollback(current, target_version) {
        info!("Rolling back migration {}: {}", migration.version, migration.name);

        let statement = format!(
            "BEGIN TRANSACTION;\n{}\nDELETE migration WHERE version = $version;\nCOMMIT TRANSACTION;",
            migration.down
        );

        db.query(statement)
            .bind(("version", migration.version))
            .await
            .and_then(|response| response.check())
            .with_context(|| format!("Failed to rollback migration {}", migration.version))?;

        info!("Migration {} rolled back successfully", migration.version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_strictly_increasing() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.first(), Some(&1));
    }

    #[test]
    fn test_pending_and_rollback_selection() {
        let names: Vec<_> = pending(0).iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["create_visit_table", "create_visit_counter"]);
        assert!(pending(2).is_empty());

        let versions: Vec<_> = to_rollback(2, 0).iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 1]);
        assert!(to_rollback(1, 1).is_empty());
    }

    #[test]
    fn test_every_migration_can_be_undone() {
        for migration in MIGRATIONS {
            assert!(!migration.up.trim().is_empty());
            assert!(migration.down.contains("REMOVE"));
        }
    }
}
