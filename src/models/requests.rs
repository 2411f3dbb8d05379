//! Request DTOs for the lookup API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;
use uuid::Uuid;

/// Largest id list accepted in one lookup.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Request body for every batch lookup (`POST /lookups/{entity}/{op}`).
///
/// Duplicate ids are accepted and collapse in the result.
#[derive(Debug, Clone, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<Uuid>,
}

impl IdsRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.ids.is_empty() {
            return Some("ids cannot be empty".to_string());
        }
        if self.ids.len() > MAX_BATCH_SIZE {
            return Some(format!(
                "ids exceeds maximum batch size of {}",
                MAX_BATCH_SIZE
            ));
        }
        None
    }
}
