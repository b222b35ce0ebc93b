use crate::intake::session::{DraftSession, SessionDeps};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("draft limit of {0} reached")]
    Full(usize),
}

struct Entry {
    session: DraftSession,
    last_touch: Instant,
    tick: u64,
}

#[derive(Default)]
struct Live {
    entries: HashMap<Uuid, Entry>,
    ticks: u64,
}

impl Live {
    fn next_tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Drops drafts nobody touched within `idle`. Busy drafts are kept.
    fn sweep(&mut self, idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.session.is_busy() || entry.last_touch.elapsed() < idle);
        before - self.entries.len()
    }

    /// Drops the least recently touched draft that has no work running.
    fn evict_oldest(&mut self) -> Option<Uuid> {
        let id = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.session.is_busy())
            .min_by_key(|(_, entry)| entry.tick)
            .map(|(id, _)| *id)?;
        self.entries.remove(&id);
        Some(id)
    }
}

/// Live drafts keyed by id. Drafts left idle past the configured window are
/// dropped, and a full registry drops its least recently used idle draft.
#[derive(Clone)]
pub struct DraftRegistry {
    live: Arc<Mutex<Live>>,
    deps: SessionDeps,
    capacity: usize,
    idle: Duration,
}

impl DraftRegistry {
    pub fn new(deps: SessionDeps, capacity: usize, idle: Duration) -> Self {
        Self {
            live: Arc::new(Mutex::new(Live::default())),
            deps,
            capacity,
            idle,
        }
    }

    pub async fn create(&self) -> Result<DraftSession, RegistryError> {
        let mut live = self.live.lock().await;
        let expired = live.sweep(self.idle);
        if expired > 0 {
            info!(target = "intake.registry", expired, "idle_drafts_evicted");
        }
        if live.entries.len() >= self.capacity {
            let evicted = live
                .evict_oldest()
                .ok_or(RegistryError::Full(self.capacity))?;
            info!(target = "intake.registry", draft_id = %evicted, "oldest_draft_evicted");
        }

        let session = DraftSession::new(&self.deps);
        let tick = live.next_tick();
        live.entries.insert(
            session.id(),
            Entry {
                session: session.clone(),
                last_touch: Instant::now(),
                tick,
            },
        );
        info!(target = "intake.registry", draft_id = %session.id(), live = live.entries.len(), "draft_created");
        Ok(session)
    }

    /// Looks a draft up and marks it as recently used.
    pub async fn get(&self, id: Uuid) -> Option<DraftSession> {
        let mut live = self.live.lock().await;
        let tick = live.next_tick();
        let entry = live.entries.get_mut(&id)?;
        entry.last_touch = Instant::now();
        entry.tick = tick;
        Some(entry.session.clone())
    }

    /// Drops the registry's handle. Work already spawned for the draft keeps
    /// its own clone and finishes on its own.
    pub async fn discard(&self, id: Uuid) -> bool {
        let removed = self.live.lock().await.entries.remove(&id).is_some();
        if removed {
            info!(target = "intake.registry", draft_id = %id, "draft_discarded");
        }
        removed
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.live.lock().await.entries.len()
    }
}
