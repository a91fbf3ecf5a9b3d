//! Applies the bookkeeping schema.
//!
//! Each migration is recorded in `schema_migrations` together with a SHA-256
//! of its SQL. A recorded migration whose SQL has since changed is refused
//! instead of silently skipped.

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{Migration, MIGRATIONS};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Migration {name} was applied with different SQL (recorded {recorded}, now {current})")]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },
}

const CREATE_TRACKING_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    name VARCHAR(128) PRIMARY KEY,
    checksum CHAR(64) NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Hex SHA-256 of a migration's SQL, ignoring surrounding whitespace.
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.trim().as_bytes()))
}

pub struct MigrationRunner {
    pool: PgPool,
    migrations: &'static [Migration],
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            migrations: MIGRATIONS,
        }
    }

    /// Applies pending migrations in order and returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        sqlx::query(CREATE_TRACKING_TABLE)
            .execute(&self.pool)
            .await?;

        let mut applied = 0;
        for migration in self.migrations {
            let current = checksum(migration.sql);
            match self.recorded_checksum(migration.name).await? {
                Some(recorded) if recorded == current => {
                    debug!(migration = migration.name, "Already applied");
                }
                Some(recorded) => {
                    return Err(MigrationError::ChecksumMismatch {
                        name: migration.name.to_string(),
                        recorded,
                        current,
                    });
                }
                None => {
                    self.apply(migration, &current).await?;
                    info!(migration = migration.name, "Applied migration");
                    applied += 1;
                }
            }
        }

        Ok(applied)
    }

    async fn recorded_checksum(&self, name: &str) -> Result<Option<String>, MigrationError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT checksum FROM schema_migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(checksum,)| checksum))
    }

    async fn apply(&self, migration: &Migration, checksum: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::Failed {
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;

        sqlx::query("INSERT INTO schema_migrations (name, checksum) VALUES ($1, $2)")
            .bind(migration.name)
            .bind(checksum)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_and_trimmed() {
        let a = checksum("CREATE TABLE t (id INT)");
        let b = checksum("\n  CREATE TABLE t (id INT)\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, checksum("CREATE TABLE t (id BIGINT)"));
    }

    #[test]
    fn test_every_migration_has_distinct_checksum() {
        let mut sums: Vec<String> = MIGRATIONS.iter().map(|m| checksum(m.sql)).collect();
        sums.sort();
        sums.dedup();
        assert_eq!(sums.len(), MIGRATIONS.len());
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = MigrationError::ChecksumMismatch {
            name: "0001_create_jobs".to_string(),
            recorded: "aa".to_string(),
            current: "bb".to_string(),
        };
        assert!(err.to_string().contains("0001_create_jobs"));
    }
}
