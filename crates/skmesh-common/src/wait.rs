//! Fan-out helpers
//!
//! Each helper spawns one task per operation and collects results under a
//! different policy:
//! - [`wait_all`] waits for every operation; results keep input order
//! - [`wait_any`] returns the first operation to complete
//! - [`wait_any_success`] returns the first operation to complete without error,
//!   or a [`MultiError`] holding every failure when none succeeds
//!
//! Operations that lose the race in `wait_any` / `wait_any_success` keep
//! running to completion; their results are discarded without blocking them.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{MeshError, MultiError};

/// Run all operations concurrently and wait until every one has returned.
///
/// The returned vector is indexed by input position regardless of completion
/// order. A panic inside an operation is resumed on the caller.
pub async fn wait_all<I, F, T>(operations: I) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = operations.into_iter().map(tokio::spawn).collect();

    let mut slots: Vec<Option<T>> = Vec::with_capacity(handles.len());
    slots.resize_with(handles.len(), || None);

    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(value) => slots[i] = Some(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => unreachable!("fan-out task cancelled: {}", e),
        }
    }

    slots.into_iter().flatten().collect()
}

/// Run all operations concurrently and return the value of the first one to
/// complete. Returns `None` when there is nothing to run.
pub async fn wait_any<I, F, T>(operations: I) -> Option<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));

    let mut spawned = 0usize;
    for operation in operations {
        let slot = slot.clone();
        spawned += 1;
        tokio::spawn(async move {
            let value = operation.await;
            let winner = slot.lock().take();
            match winner {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => trace!("wait_any: discarding late completion"),
            }
        });
    }
    drop(slot);

    if spawned == 0 {
        return None;
    }

    rx.await.ok()
}

struct AnySuccess<T> {
    tx: Option<oneshot::Sender<Result<T, MultiError>>>,
    errors: Vec<Option<MeshError>>,
    failed: usize,
}

/// Run all operations concurrently and return the first successful result.
///
/// When every operation fails the combined error lists each failure in input
/// order. Returns an empty `MultiError` when there is nothing to run.
pub async fn wait_any_success<I, F, T>(operations: I) -> Result<T, MultiError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, MeshError>> + Send + 'static,
    T: Send + 'static,
{
    let operations: Vec<F> = operations.into_iter().collect();
    let total = operations.len();
    if total == 0 {
        return Err(MultiError::default());
    }

    let (tx, rx) = oneshot::channel();
    let mut errors = Vec::with_capacity(total);
    errors.resize_with(total, || None);
    let state = Arc::new(Mutex::new(AnySuccess {
        tx: Some(tx),
        errors,
        failed: 0,
    }));

    for (index, operation) in operations.into_iter().enumerate() {
        let state = state.clone();
        tokio::spawn(async move {
            let result = operation.await;

            let mut guard = state.lock();
            if guard.tx.is_none() {
                trace!("wait_any_success: discarding late completion of #{}", index);
                return;
            }

            match result {
                Ok(value) => {
                    if let Some(tx) = guard.tx.take() {
                        let _ = tx.send(Ok(value));
                    }
                }
                Err(err) => {
                    guard.errors[index] = Some(err);
                    guard.failed += 1;
                    if guard.failed >= total {
                        let errors = guard.errors.iter_mut().filter_map(Option::take).collect();
                        if let Some(tx) = guard.tx.take() {
                            let _ = tx.send(Err(MultiError::new(errors)));
                        }
                    }
                }
            }
        });
    }
    drop(state);

    match rx.await {
        Ok(result) => result,
        // Every task ended without delivering, which only happens on panic.
        Err(_) => Err(MultiError::new(vec![MeshError::Other(anyhow::anyhow!(
            "operation panicked before completing"
        ))])),
    }
}
