//! IO modules - external system interfaces
//!
//! This module contains the seams to everything the core does not own:
//! - `store` - Local key-value state store (memory and JSON file backends)
//! - `remote_api` - HTTP client for the backend location endpoints
//! - `location` - Host location service (geofence + continuous updates)
//! - `event_feed` - JSONL replay of host callbacks for the agent binary

pub mod event_feed;
pub mod location;
pub mod remote_api;
pub mod store;

// Re-export commonly used types
pub use location::{LocationProvider, ProviderError, SimulatedLocationProvider};
pub use remote_api::{ApiError, HttpLocationApi, RemoteLocationApi};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
