use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Result, ServiceError},
    models::{Visit, VisitInput},
    pool::{Connection, Pool, PoolExt},
    repository::VisitRepository,
};

const VISIT_FIELDS: &str = "record::id(id) AS id, first_name, last_name, created_at, updated_at";

#[derive(Debug, Deserialize)]
struct VisitRow {
    id: i64,
    first_name: Option<String>,
    last_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<VisitRow> for Visit {
    type Error = ServiceError;

    fn try_from(row: VisitRow) -> Result<Self> {
        let id = u32::try_from(row.id).map_err(|_| {
            ServiceError::Internal(anyhow::anyhow!("visit id {} out of range", row.id))
        })?;

        Ok(Visit {
            id,
            first_name: row.first_name.unwrap_or_default(),
            last_name: row.last_name.unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Visits stored in SurrealDB. Ids are integers allocated from the
/// `visit_counter:visit` record.
#[derive(Clone)]
pub struct SurrealVisitRepository {
    pool: Pool,
}

impl SurrealVisitRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            let stats = self.pool.stats();
            debug!(
                "Pool exhausted: size={}, available={}, waiting={}",
                stats.size, stats.available, stats.waiting
            );
            ServiceError::Pool(e.to_string())
        })
    }
}

fn into_visit(row: Option<VisitRow>, id: u32) -> Result<Visit> {
    row.ok_or(ServiceError::NotFound { entity: "visit", id })?
        .try_into()
}

#[async_trait]
impl VisitRepository for SurrealVisitRepository {
    async fn find(&self, id: u32) -> Result<Visit> {
        let conn = self.connection().await?;

        let mut response = conn
            .query(format!(
                "SELECT {} FROM ONLY type::thing('visit', $id)",
                VISIT_FIELDS
            ))
            .bind(("id", id))
            .await?;
        let row: Option<VisitRow> = response.take(0)?;

        into_visit(row, id)
    }

    async fn insert(&self, input: VisitInput) -> Result<Visit> {
        let conn = self.connection().await?;

        let query = format!(
            r#"
            LET $next = (UPSERT ONLY visit_counter:visit SET value += 1 RETURN VALUE value);
            CREATE type::thing('visit', $next) SET
                first_name = $first_name,
                last_name = $last_name,
                created_at = time::now(),
                updated_at = time::now()
            RETURN NONE;
            SELECT {} FROM ONLY type::thing('visit', $next);
        "#,
            VISIT_FIELDS
        );

        let mut response = conn
            .query(query)
            .bind(("first_name", input.first_name))
            .bind(("last_name", input.last_name))
            .await?;
        let row: Option<VisitRow> = response.take(2)?;

        let visit: Visit = row
            .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("inserted visit was not returned")))?
            .try_into()?;
        debug!("Inserted visit {:?}", visit);

        Ok(visit)
    }

    async fn upsert(&self, input: VisitInput) -> Result<Visit> {
        let conn = self.connection().await?;
        let id = input.id;

        let query = format!(
            r#"
            UPSERT type::thing('visit', $id) SET
                first_name = $first_name,
                last_name = $last_name,
                created_at = created_at ?? time::now(),
                updated_at = time::now()
            RETURN NONE;
            UPSERT visit_counter:visit SET value = math::max([value ?? 0, $id]) RETURN NONE;
            SELECT {} FROM ONLY type::thing('visit', $id);
        "#,
            VISIT_FIELDS
        );

        let mut response = conn
            .query(query)
            .bind(("id", id))
            .bind(("first_name", input.first_name))
            .bind(("last_name", input.last_name))
            .await?;
        let row: Option<VisitRow> = response.take(2)?;

        debug!("Upserted visit {}", id);
        into_visit(row, id)
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.connection().await?;
        conn.query("RETURN 1").await?.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> VisitRow {
        VisitRow {
            id,
            first_name: Some("Ada".to_string()),
            last_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_conversion() {
        let visit = into_visit(Some(row(7)), 7).unwrap();
        assert_eq!(visit.id, 7);
        assert_eq!(visit.first_name, "Ada");
        assert_eq!(visit.last_name, "");
    }

    #[test]
    fn test_missing_row_is_not_found() {
        assert!(matches!(
            into_visit(None, 3),
            Err(ServiceError::NotFound { id: 3, .. })
        ));
    }

    #[test]
    fn test_negative_id_is_rejected() {
        assert!(matches!(
            Visit::try_from(row(-1)),
            Err(ServiceError::Internal(_))
        ));
    }
}
