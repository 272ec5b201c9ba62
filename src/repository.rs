use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, ServiceError};
use crate::models::{Visit, VisitInput};

/// Storage for visits. Inputs are already validated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisitRepository: Send + Sync {
    async fn find(&self, id: u32) -> Result<Visit>;

    /// Stores a new visit under a freshly allocated id
    async fn insert(&self, input: VisitInput) -> Result<Visit>;

    /// Updates the visit with `input.id`, creating it when missing.
    /// `created_at` of an existing visit is kept.
    async fn upsert(&self, input: VisitInput) -> Result<Visit>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    visits: HashMap<u32, Visit>,
    last_id: u32,
}

/// In-process store used by the demo driver and in tests
#[derive(Default)]
pub struct MemoryVisitRepository {
    state: RwLock<MemoryState>,
}

impl MemoryVisitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VisitRepository for MemoryVisitRepository {
    async fn find(&self, id: u32) -> Result<Visit> {
        self.state
            .read()
            .visits
            .get(&id)
            .cloned()
            .ok_or(ServiceError::NotFound { entity: "visit", id })
    }

    async fn insert(&self, input: VisitInput) -> Result<Visit> {
        let mut state = self.state.write();
        let id = state
            .last_id
            .checked_add(1)
            .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("visit id space exhausted")))?;
        state.last_id = id;

        let now = Utc::now();
        let visit = Visit {
            id,
            first_name: input.first_name,
            last_name: input.last_name,
            created_at: now,
            updated_at: now,
        };
        state.visits.insert(id, visit.clone());
        debug!("Inserted visit {}", id);

        Ok(visit)
    }

    async fn upsert(&self, input: VisitInput) -> Result<Visit> {
        let mut state = self.state.write();
        let now = Utc::now();
        let id = input.id;

        // Never hand out an id that was supplied explicitly
        state.last_id = state.last_id.max(id);

        let created_at = state.visits.get(&id).map(|v| v.created_at).unwrap_or(now);
        let visit = Visit {
            id,
            first_name: input.first_name,
            last_name: input.last_name,
            created_at,
            updated_at: now,
        };
        state.visits.insert(id, visit.clone());
        debug!("Upserted visit {}", id);

        Ok(visit)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_allocates_increasing_ids() {
        let repo = MemoryVisitRepository::new();

        let first = repo.insert(VisitInput::new(0, "Ada", "Lovelace")).await.unwrap();
        let second = repo.insert(VisitInput::new(0, "Alan", "Turing")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.created_at, first.updated_at);
        assert_eq!(repo.find(2).await.unwrap().first_name, "Alan");
    }

    #[tokio::test]
    async fn test_find_missing() {
        let repo = MemoryVisitRepository::new();
        let result = repo.find(42).await;
        assert!(matches!(result, Err(ServiceError::NotFound { id: 42, .. })));
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at() {
        let repo = MemoryVisitRepository::new();
        let original = repo.insert(VisitInput::new(0, "Ada", "Lovelace")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = repo
            .upsert(VisitInput::new(original.id, "Ada", "King"))
            .await
            .unwrap();

        assert_eq!(updated.created_at, original.created_at);
        assert!(updated.updated_at > original.updated_at);
        assert_eq!(updated.last_name, "King");
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_creates_and_reserves_id() {
        let repo = MemoryVisitRepository::new();

        let created = repo.upsert(VisitInput::new(10, "Grace", "Hopper")).await.unwrap();
        assert_eq!(created.id, 10);

        let next = repo.insert(VisitInput::new(0, "Ada", "Lovelace")).await.unwrap();
        assert_eq!(next.id, 11);
    }
}
