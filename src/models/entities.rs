//! Entity records returned by the downstream services
//!
//! Each record type carries its cache namespace and the policy applied when a
//! requested id cannot be resolved at all.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker written into placeholder records when a downstream is unavailable.
pub const UNAVAILABLE_MARKER: &str = "Temporarily unavailable";

/// Marker written into substitute records for ids nobody could resolve.
pub const NO_INFO_MARKER: &str = "No Info";

/// What an info lookup returns for an id that neither the cache nor the
/// downstream resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingInfoPolicy {
    /// Leave the id out of the result
    Omit,
    /// Return a "No Info" record for the id
    Substitute,
}

/// An immutable info record for one entity type.
pub trait EntityInfo:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Entity name used in cache keys and log fields.
    const ENTITY: &'static str;

    const MISSING_POLICY: MissingInfoPolicy;

    fn id(&self) -> Uuid;

    /// Builds a record whose text fields all carry `marker`.
    fn with_marker(id: Uuid, marker: &str) -> Self;

    /// Returns true if the record is a placeholder rather than real data.
    fn is_placeholder(&self) -> bool;

    /// Placeholder for an id whose downstream could not answer.
    fn unavailable(id: Uuid) -> Self {
        Self::with_marker(id, UNAVAILABLE_MARKER)
    }

    /// Substitute for an id nobody could resolve.
    fn no_info(id: Uuid) -> Self {
        Self::with_marker(id, NO_INFO_MARKER)
    }
}

// == Product ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    #[serde(alias = "productId", alias = "ID", alias = "Id")]
    pub id: Uuid,
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Category")]
    pub category: String,
    #[serde(alias = "UnitPrice")]
    pub unit_price: f64,
    #[serde(alias = "QuantityInStock")]
    pub quantity_in_stock: i32,
}

impl EntityInfo for ProductInfo {
    const ENTITY: &'static str = "product";
    const MISSING_POLICY: MissingInfoPolicy = MissingInfoPolicy::Substitute;

    fn id(&self) -> Uuid {
        self.id
    }

    fn with_marker(id: Uuid, marker: &str) -> Self {
        Self {
            id,
            name: marker.to_string(),
            category: marker.to_string(),
            unit_price: 0.0,
            quantity_in_stock: 0,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.name == UNAVAILABLE_MARKER && self.category == UNAVAILABLE_MARKER
    }
}

// == User ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(alias = "id", alias = "UserId")]
    pub user_id: Uuid,
    #[serde(alias = "Email")]
    pub email: String,
    #[serde(alias = "name", alias = "PersonName")]
    pub person_name: String,
    #[serde(alias = "Gender")]
    pub gender: String,
}

impl EntityInfo for UserInfo {
    const ENTITY: &'static str = "user";
    const MISSING_POLICY: MissingInfoPolicy = MissingInfoPolicy::Omit;

    fn id(&self) -> Uuid {
        self.user_id
    }

    fn with_marker(id: Uuid, marker: &str) -> Self {
        Self {
            user_id: id,
            email: marker.to_string(),
            person_name: marker.to_string(),
            gender: marker.to_string(),
        }
    }

    fn is_placeholder(&self) -> bool {
        self.email == UNAVAILABLE_MARKER && self.person_name == UNAVAILABLE_MARKER
    }
}
