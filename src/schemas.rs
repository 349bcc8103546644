use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;
use crate::models::TriggeredBy;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_triggered_by() -> TriggeredBy {
    TriggeredBy::Manual
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncListingInput {
    /// Join an existing session instead of opening a new one.
    pub session_id: Option<Uuid>,
    pub triggered_by: Option<TriggeredBy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncAllInput {
    #[serde(default = "default_triggered_by")]
    pub triggered_by: TriggeredBy,
}

impl Default for SyncAllInput {
    fn default() -> Self {
        Self {
            triggered_by: default_triggered_by(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingPath {
    pub listing_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPath {
    pub session_id: Uuid,
}

fn default_session_limit() -> i64 {
    50
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SessionsQuery {
    #[serde(default = "default_session_limit")]
    #[validate(range(min = 1, max = 500))]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SessionEntriesQuery {
    #[serde(default = "default_entries_limit")]
    #[validate(range(min = 1, max = 5000))]
    pub limit: i64,
}

fn default_entries_limit() -> i64 {
    1000
}
