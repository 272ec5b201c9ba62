use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Result, ServiceError};
use crate::validation::validate_struct;

/// A stored visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: u32,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incoming write. `id == 0` asks the store to allocate a new id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
pub struct VisitInput {
    pub id: u32,
    #[validate(length(min = 2, max = 255))]
    pub first_name: String,
    #[validate(length(min = 2, max = 255))]
    pub last_name: String,
}

impl VisitInput {
    pub fn new(id: u32, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    pub fn check(&self) -> Result<()> {
        validate_struct("Visit", self).map_err(ServiceError::Validation)
    }
}
