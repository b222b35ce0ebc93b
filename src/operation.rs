//! Loading/success/failure lifecycle shared by every mutating action.
//!
//! An [`AsyncOperation`] wraps one asynchronous action and publishes its
//! state through a `watch` channel. Invocations are not queued: when two run
//! concurrently the one that completes last owns the published state.
//! Callers that need single-flight semantics use
//! [`AsyncOperation::invoke_exclusive`].

use futures::{FutureExt, future::BoxFuture};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum OperationState<O, E> {
    Idle,
    Loading,
    Success(O),
    Failure(E),
}

impl<O, E> OperationState<O, E> {
    pub fn label(&self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::Loading => "loading",
            OperationState::Success(_) => "success",
            OperationState::Failure(_) => "error",
        }
    }
}

/// What happened to one invocation once its action settled.
#[derive(Debug)]
pub enum Completion<O, E> {
    /// The result was published as the operation's current state.
    Applied(Result<O, E>),
    /// The operation was reset while the action ran; nothing was published.
    Discarded,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation `{0}` is already in flight")]
pub struct OperationBusy(pub &'static str);

type Action<I, O, E> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, E>> + Send + Sync>;

pub struct AsyncOperation<I, O, E> {
    name: &'static str,
    action: Action<I, O, E>,
    state: watch::Sender<OperationState<O, E>>,
    generation: AtomicU64,
    exclusive: AtomicBool,
}

impl<I, O, E> AsyncOperation<I, O, E>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: &'static str, action: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let action: Action<I, O, E> = Arc::new(move |input: I| action(input).boxed());
        let (state, _) = watch::channel(OperationState::Idle);
        Self {
            name,
            action,
            state,
            generation: AtomicU64::new(0),
            exclusive: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> OperationState<O, E> {
        self.state.borrow().clone()
    }

    /// Receiver that observes every published transition.
    #[allow(dead_code)]
    pub fn subscribe(&self) -> watch::Receiver<OperationState<O, E>> {
        self.state.subscribe()
    }

    /// True while an exclusive invocation holds the single-flight guard.
    pub fn is_in_flight(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    /// Runs the action once and publishes its result. Does not wait for or
    /// reject other invocations.
    pub async fn invoke(&self, input: I) -> Completion<O, E> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *state = OperationState::Loading;
            true
        });

        let result = (self.action)(input).await;

        let published = self.state.send_if_modified(|state| {
            // reset() bumps the generation under the same lock
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *state = match &result {
                Ok(value) => OperationState::Success(value.clone()),
                Err(err) => OperationState::Failure(err.clone()),
            };
            true
        });

        if published {
            Completion::Applied(result)
        } else {
            debug!(
                target = "intake.operation",
                operation = self.name,
                generation,
                "stale_completion_discarded"
            );
            Completion::Discarded
        }
    }

    /// Like [`invoke`](Self::invoke), but rejects the call while another
    /// exclusive invocation is still running.
    pub async fn invoke_exclusive(&self, input: I) -> Result<Completion<O, E>, OperationBusy> {
        if self
            .exclusive
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OperationBusy(self.name));
        }
        let _guard = ExclusiveGuard(&self.exclusive);
        Ok(self.invoke(input).await)
    }

    /// Returns to `Idle`; completions of invocations started before the
    /// reset are discarded.
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = OperationState::Idle;
        });
    }
}

struct ExclusiveGuard<'a>(&'a AtomicBool);

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
