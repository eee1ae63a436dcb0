//! Resume Store (C2): short-TTL snapshots of per-connection delivery state,
//! keyed by an opaque resume token.
//!
//! Two implementations behind one trait, same shape as this codebase's
//! existing moka-backed caches: an in-memory one for single-node
//! development, and a `moka` TTL cache for the shared-cache production
//! case. Both are last-writer-wins; callers reconcile staleness by
//! comparing `lastServerSeq`, never by trusting store freshness.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

use crate::models::ResumeSnapshot;

#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load(&self, token: &str) -> Option<ResumeSnapshot>;
    async fn persist(&self, token: &str, snapshot: ResumeSnapshot);
    async fn drop_token(&self, token: &str);
}

/// Single-node development store. TTL is enforced by `moka` the same as
/// the shared-cache variant; there is no cross-process durability.
pub struct InMemoryResumeStore {
    cache: Cache<String, ResumeSnapshot>,
}

impl InMemoryResumeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn load(&self, token: &str) -> Option<ResumeSnapshot> {
        self.cache.get(token).await
    }

    async fn persist(&self, token: &str, snapshot: ResumeSnapshot) {
        self.cache.insert(token.to_string(), snapshot).await;
    }

    async fn drop_token(&self, token: &str) {
        self.cache.invalidate(token).await;
    }
}

/// Shared-cache store backed by the same `moka` future cache, wired so a
/// later swap to an external process (e.g. a key-value service) only
/// touches this file. TTL is re-applied on every write, matching the
/// "expires even if the process crashed" invariant as closely as an
/// in-process cache can: a crash loses the whole cache, which is
/// acceptable because a lost resume token simply fails the resume and the
/// client falls back to a fresh connection.
pub struct SharedResumeStore {
    cache: Cache<String, ResumeSnapshot>,
}

impl SharedResumeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl ResumeStore for SharedResumeStore {
    async fn load(&self, token: &str) -> Option<ResumeSnapshot> {
        self.cache.get(token).await
    }

    async fn persist(&self, token: &str, snapshot: ResumeSnapshot) {
        self.cache.insert(token.to_string(), snapshot).await;
    }

    async fn drop_token(&self, token: &str) {
        self.cache.invalidate(token).await;
    }
}

pub fn generate_resume_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let store = InMemoryResumeStore::new(Duration::from_secs(60));
        let snapshot = ResumeSnapshot {
            account_id: "acct-1".into(),
            device_id: "device-1".into(),
            last_server_seq: 7,
            pending_tail: vec![],
        };
        store.persist("tok-1", snapshot.clone()).await;
        let loaded = store.load("tok-1").await.unwrap();
        assert_eq!(loaded.last_server_seq, 7);
    }

    #[tokio::test]
    async fn drop_removes_entry() {
        let store = InMemoryResumeStore::new(Duration::from_secs(60));
        store
            .persist(
                "tok-2",
                ResumeSnapshot {
                    account_id: "acct".into(),
                    device_id: "device".into(),
                    last_server_seq: 1,
                    pending_tail: vec![],
                },
            )
            .await;
        store.drop_token("tok-2").await;
        assert!(store.load("tok-2").await.is_none());
    }

    #[test]
    fn resume_tokens_are_unique_and_high_entropy() {
        let a = generate_resume_token();
        let b = generate_resume_token();
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }
}
