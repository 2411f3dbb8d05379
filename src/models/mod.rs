//! Entity records and HTTP models for the lookup gateway
//!
//! `entities` holds the records the downstream services return; `requests`
//! and `responses` are the DTOs of the gateway's own HTTP surface.

pub mod entities;
pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use entities::{
    EntityInfo, MissingInfoPolicy, ProductInfo, UserInfo, NO_INFO_MARKER, UNAVAILABLE_MARKER,
};
pub use requests::IdsRequest;
pub use responses::{ExistsResponse, HealthResponse, InfoResponse, StatsResponse};
