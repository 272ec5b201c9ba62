use std::sync::Arc;
use tracing::{debug, instrument};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::Result;
use crate::models::{Visit, VisitInput};
use crate::repository::VisitRepository;
use crate::retry::{with_breaker_and_retry, RetryConfig};

pub const DATABASE_BREAKER: &str = "database";

/// Application service behind both the gRPC and HTTP surfaces
#[derive(Clone)]
pub struct VisitService {
    repository: Arc<dyn VisitRepository>,
    breakers: Arc<CircuitBreakerManager>,
    retry: RetryConfig,
}

impl VisitService {
    pub fn new(
        repository: Arc<dyn VisitRepository>,
        breakers: Arc<CircuitBreakerManager>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            repository,
            breakers,
            retry,
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: u32) -> Result<Visit> {
        let repository = self.repository.clone();
        with_breaker_and_retry(&self.breakers, DATABASE_BREAKER, &self.retry, || {
            let repository = repository.clone();
            async move { repository.find(id).await }
        })
        .await
    }

    /// Inserts when `input.id` is 0, otherwise upserts. Writes are not retried.
    #[instrument(skip(self), fields(id = input.id))]
    pub async fn set(&self, input: VisitInput) -> Result<Visit> {
        input.check()?;

        let repository = self.repository.clone();
        let visit = self
            .breakers
            .call(DATABASE_BREAKER, || async move {
                if input.is_new() {
                    repository.insert(input).await
                } else {
                    repository.upsert(input).await
                }
            })
            .await?;

        debug!("Stored visit {}", visit.id);
        Ok(visit)
    }

    pub async fn ping(&self) -> Result<()> {
        self.repository.ping().await
    }
}
