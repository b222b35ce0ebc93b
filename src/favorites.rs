use crate::operation::{AsyncOperation, Completion};
use crate::store::{SavedCarStore, StoreError};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

type ToggleOperation = AsyncOperation<(), bool, StoreError>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub saved: bool,
    pub message: &'static str,
}

impl ToggleOutcome {
    fn new(saved: bool) -> Self {
        let message = if saved {
            "Car added to favorites"
        } else {
            "Car removed from favorites"
        };
        Self { saved, message }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FavoriteError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("a favourite update for this car is already running")]
    InFlight,
    #[error("failed to update favourites: {0}")]
    Store(#[from] StoreError),
}

/// Saved-car toggle with one single-flight operation per user and car.
#[derive(Clone)]
pub struct FavoriteToggle {
    store: Arc<dyn SavedCarStore>,
    operations: Arc<Mutex<HashMap<(String, String), Arc<ToggleOperation>>>>,
}

impl FavoriteToggle {
    pub fn new(store: Arc<dyn SavedCarStore>) -> Self {
        Self {
            store,
            operations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn operation(&self, user_id: &str, car_id: &str) -> Arc<ToggleOperation> {
        let key = (user_id.to_string(), car_id.to_string());
        let mut operations = self.operations.lock().await;
        operations
            .entry(key)
            .or_insert_with(|| {
                let store = self.store.clone();
                let user_id = user_id.to_string();
                let car_id = car_id.to_string();
                Arc::new(AsyncOperation::new("toggle_saved_car", move |()| {
                    let store = store.clone();
                    let user_id = user_id.clone();
                    let car_id = car_id.clone();
                    async move { store.toggle_saved(&user_id, &car_id).await }
                }))
            })
            .clone()
    }

    /// Forgets the pair's operation once no caller holds it. Handles are only
    /// cloned under the map lock, so the count cannot grow behind our back.
    async fn release(&self, user_id: &str, car_id: &str, operation: Arc<ToggleOperation>) {
        let key = (user_id.to_string(), car_id.to_string());
        let mut operations = self.operations.lock().await;
        let idle = operations.get(&key).is_some_and(|tracked| {
            Arc::ptr_eq(tracked, &operation)
                && Arc::strong_count(&operation) == 2
                && !operation.is_in_flight()
        });
        if idle {
            operations.remove(&key);
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn toggle(&self, user_id: &str, car_id: &str) -> Result<ToggleOutcome, FavoriteError> {
        if user_id.trim().is_empty() {
            return Err(FavoriteError::InvalidInput("Please sign in to save cars"));
        }
        if car_id.trim().is_empty() {
            return Err(FavoriteError::InvalidInput("car id is required"));
        }

        let operation = self.operation(user_id, car_id).await;
        let completion = operation.invoke_exclusive(()).await;
        self.release(user_id, car_id, operation).await;
        let completion = completion.map_err(|_| FavoriteError::InFlight)?;

        match completion {
            Completion::Applied(Ok(saved)) => {
                crate::metrics::favorite_toggled(saved);
                info!(target = "intake.favorites", user_id, car_id, saved, "favorite_toggled");
                Ok(ToggleOutcome::new(saved))
            }
            Completion::Applied(Err(err)) => {
                warn!(target = "intake.favorites", user_id, car_id, error = %err, "favorite_toggle_failed");
                Err(err.into())
            }
            // toggle operations are never reset
            Completion::Discarded => Err(FavoriteError::InFlight),
        }
    }
}
