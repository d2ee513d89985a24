//! Persistence interfaces for counter records and identity rankings.
//!
//! The engine is the only writer; backends just round-trip records under a
//! caller-supplied TTL. Missing records load as defaults so first sightings
//! need no special casing.

mod memory;

pub use memory::{MemoryRanking, MemoryStore};

use crate::endpoint::EndpointRecord;
use crate::identity::Identity;
use async_trait::async_trait;
use std::time::Duration;

/// Persistence of endpoint records, in both scopes.
///
/// Serialization is the backend's concern, but records must round-trip
/// exactly, including hit ordering.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load the global record for an endpoint, defaulting when absent.
    async fn load_global(&self, method: &str, path: &str) -> anyhow::Result<EndpointRecord>;

    /// Persist the global record with the given TTL.
    async fn save_global(&self, record: &EndpointRecord, ttl: Duration) -> anyhow::Result<()>;

    /// Load the per-identity record for an endpoint, defaulting when absent.
    async fn load_local(
        &self,
        method: &str,
        path: &str,
        unique_id: &str,
    ) -> anyhow::Result<EndpointRecord>;

    /// Persist the per-identity record with the given TTL.
    async fn save_local(
        &self,
        record: &EndpointRecord,
        identity: &Identity,
        ttl: Duration,
    ) -> anyhow::Result<()>;
}

/// Persistence of identities and their ranks.
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Load a previously persisted identity, if any.
    async fn load(&self, unique_id: &str) -> anyhow::Result<Option<Identity>>;

    /// Persist an identity with the given TTL.
    async fn save(&self, identity: &Identity, ttl: Duration) -> anyhow::Result<()>;
}
