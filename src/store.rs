use crate::intake::draft::{CarRecord, ListingSubmission};
use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredListing {
    pub id: String,
    pub image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Persists a fully validated listing with its images.
pub trait ListingStore: Send + Sync {
    fn add_car(&self, submission: ListingSubmission)
    -> BoxFuture<'_, Result<StoredListing, StoreError>>;
}

/// Flips a user's saved flag for one listing and returns the new value.
pub trait SavedCarStore: Send + Sync {
    fn toggle_saved<'a>(
        &'a self,
        user_id: &'a str,
        car_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;
}

/// In-process backend used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    listings: Mutex<Vec<(StoredListing, CarRecord)>>,
    saved: Mutex<HashSet<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn listings(&self) -> Vec<(StoredListing, CarRecord)> {
        self.listings.lock().await.clone()
    }
}

impl ListingStore for MemoryStore {
    fn add_car(
        &self,
        submission: ListingSubmission,
    ) -> BoxFuture<'_, Result<StoredListing, StoreError>> {
        async move {
            let stored = StoredListing {
                id: Uuid::new_v4().to_string(),
                image_urls: submission.images,
                created_at: Utc::now(),
            };
            self.listings
                .lock()
                .await
                .push((stored.clone(), submission.car));
            Ok(stored)
        }
        .boxed()
    }
}

impl SavedCarStore for MemoryStore {
    fn toggle_saved<'a>(
        &'a self,
        user_id: &'a str,
        car_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let key = (user_id.to_string(), car_id.to_string());
            let mut saved = self.saved.lock().await;
            if saved.remove(&key) {
                Ok(false)
            } else {
                saved.insert(key);
                Ok(true)
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toggle_flips_per_user_and_car() {
        let store = MemoryStore::new();
        assert!(store.toggle_saved("u1", "car-1").await.unwrap());
        assert!(store.toggle_saved("u2", "car-1").await.unwrap());
        assert!(!store.toggle_saved("u1", "car-1").await.unwrap());
        assert!(store.toggle_saved("u1", "car-1").await.unwrap());
    }
}
