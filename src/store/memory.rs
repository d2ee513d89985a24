//! In-process store backends for development and tests.
//!
//! Entries hold serialized JSON rather than live structs, so the round-trip
//! behavior matches an external KV backend. Expiry is lazy: expired entries
//! are dropped on the next read.

use super::{RankingStore, Store};
use crate::endpoint::EndpointRecord;
use crate::identity::Identity;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

fn endpoint_key(method: &str, path: &str, unique_id: Option<&str>) -> String {
    match unique_id {
        Some(id) => format!("endpoint:{method}:{path}:identity:{id}"),
        None => format!("endpoint:{method}:{path}"),
    }
}

#[derive(Debug)]
struct Entry {
    payload: String,
    expires_at: Instant,
}

fn fetch(map: &DashMap<String, Entry>, key: &str) -> Option<String> {
    let expired = match map.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => return Some(entry.payload.clone()),
        Some(_) => true,
        None => false,
    };
    if expired {
        map.remove(key);
    }
    None
}

fn put(map: &DashMap<String, Entry>, key: String, payload: String, ttl: Duration) {
    map.insert(
        key,
        Entry {
            payload,
            expires_at: Instant::now() + ttl,
        },
    );
}

/// [`Store`] backend on a concurrent in-process map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn load(&self, key: &str, method: &str, path: &str) -> anyhow::Result<EndpointRecord> {
        match fetch(&self.records, key) {
            Some(payload) => Ok(serde_json::from_str(&payload)?),
            None => Ok(EndpointRecord::new(method, path)),
        }
    }

    async fn save(&self, key: String, record: &EndpointRecord, ttl: Duration) -> anyhow::Result<()> {
        put(&self.records, key, serde_json::to_string(record)?, ttl);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_global(&self, method: &str, path: &str) -> anyhow::Result<EndpointRecord> {
        self.load(&endpoint_key(method, path, None), method, path)
            .await
    }

    async fn save_global(&self, record: &EndpointRecord, ttl: Duration) -> anyhow::Result<()> {
        self.save(
            endpoint_key(&record.method, &record.path, None),
            record,
            ttl,
        )
        .await
    }

    async fn load_local(
        &self,
        method: &str,
        path: &str,
        unique_id: &str,
    ) -> anyhow::Result<EndpointRecord> {
        self.load(&endpoint_key(method, path, Some(unique_id)), method, path)
            .await
    }

    async fn save_local(
        &self,
        record: &EndpointRecord,
        identity: &Identity,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.save(
            endpoint_key(&record.method, &record.path, Some(&identity.unique_id)),
            record,
            ttl,
        )
        .await
    }
}

/// [`RankingStore`] backend on a concurrent in-process map.
#[derive(Debug, Default)]
pub struct MemoryRanking {
    identities: DashMap<String, Entry>,
}

impl MemoryRanking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RankingStore for MemoryRanking {
    async fn load(&self, unique_id: &str) -> anyhow::Result<Option<Identity>> {
        match fetch(&self.identities, &format!("identity:{unique_id}")) {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, identity: &Identity, ttl: Duration) -> anyhow::Result<()> {
        put(
            &self.identities,
            format!("identity:{}", identity.unique_id),
            serde_json::to_string(identity)?,
            ttl,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn missing_records_load_as_defaults() {
        let store = MemoryStore::new();
        let global = store.load_global("GET", "/hello").await.unwrap();
        assert_eq!(global, EndpointRecord::new("GET", "/hello"));

        let local = store.load_local("GET", "/hello", "u1").await.unwrap();
        assert_eq!(local, EndpointRecord::new("GET", "/hello"));
    }

    #[tokio::test]
    async fn scopes_do_not_collide() {
        let store = MemoryStore::new();
        let mut local = EndpointRecord::new("GET", "/hello");
        local.hits = vec![at(1), at(2)];
        store
            .save_local(&local, &Identity::new("u1", "default"), TTL)
            .await
            .unwrap();

        let global = store.load_global("GET", "/hello").await.unwrap();
        assert!(global.hits.is_empty());

        let other = store.load_local("GET", "/hello", "u2").await.unwrap();
        assert!(other.hits.is_empty());

        let back = store.load_local("GET", "/hello", "u1").await.unwrap();
        assert_eq!(back.hits, vec![at(1), at(2)]);
    }

    #[tokio::test]
    async fn records_round_trip_through_serialization() {
        let store = MemoryStore::new();
        let mut record = EndpointRecord::new("POST", "/items");
        record.hits = vec![at(3), at(7)];
        record.ignore_times = Some(2);
        store.save_global(&record, TTL).await.unwrap();

        let back = store.load_global("POST", "/items").await.unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn expired_entries_load_as_defaults() {
        let store = MemoryStore::new();
        let mut record = EndpointRecord::new("GET", "/hello");
        record.hits = vec![at(1)];
        store.save_global(&record, Duration::ZERO).await.unwrap();

        let back = store.load_global("GET", "/hello").await.unwrap();
        assert!(back.hits.is_empty());
    }

    #[tokio::test]
    async fn ranking_round_trips() {
        let ranking = MemoryRanking::new();
        assert!(ranking.load("u1").await.unwrap().is_none());

        let identity = Identity::new("u1", "admin").with_rank(2);
        ranking.save(&identity, TTL).await.unwrap();
        assert_eq!(ranking.load("u1").await.unwrap(), Some(identity));

        let expired = Identity::new("u2", "default");
        ranking.save(&expired, Duration::ZERO).await.unwrap();
        assert!(ranking.load("u2").await.unwrap().is_none());
    }
}
