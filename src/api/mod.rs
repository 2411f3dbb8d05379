//! API Module
//!
//! HTTP handlers and routing for the lookup gateway REST API.
//!
//! # Endpoints
//! - `POST /lookups/{users,products}/exists` - batched existence checks
//! - `POST /lookups/{users,products}/by-ids` - batched info lookups
//! - `GET /stats` - Get cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
