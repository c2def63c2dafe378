//! Counting admission gate for agent work.
//!
//! A session may exist without ever holding a slot; a slot is held only while
//! the session runs a step. Capacity is a tokio semaphore, so an abandoned
//! wait (timeout, cancellation, or a dropped future) gives nothing back
//! because it never took anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub waiting: usize,
    pub capacity: usize,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
    next_slot: AtomicU64,
    /// Slots held per session
    holders: Mutex<HashMap<SessionId, usize>>,
}

impl Inner {
    fn release(&self, session_id: &SessionId) {
        let mut holders = self.holders.lock();
        if let Some(count) = holders.get_mut(session_id) {
            *count -= 1;
            if *count == 0 {
                holders.remove(session_id);
            }
        }
    }
}

pub struct AdmissionController {
    inner: Arc<Inner>,
}

/// Permission for one session to perform one unit of agent work.
///
/// Released by [`AdmissionController::release`], [`AdmissionSlot::release`],
/// or by dropping it. Releasing consumes the slot, so it can only happen once.
pub struct AdmissionSlot {
    session_id: SessionId,
    slot_id: u64,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl AdmissionSlot {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn id(&self) -> u64 {
        self.slot_id
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.inner.release(&self.session_id);
            drop(permit);
            debug!("[{}] Admission slot {} released", self.session_id, self.slot_id);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Counts a caller as waiting for as long as it is alive
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                waiting: AtomicUsize::new(0),
                next_slot: AtomicU64::new(1),
                holders: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wait without a deadline
    pub async fn acquire(&self, session_id: SessionId) -> Result<AdmissionSlot> {
        self.acquire_with(session_id, None, None).await
    }

    /// Wait for a slot.
    ///
    /// Gives up with `AdmissionTimeout` once `timeout` elapses, with
    /// `Cancelled` when `cancel` fires, and with `ShuttingDown` once the
    /// controller is closed.
    pub async fn acquire_with(
        &self,
        session_id: SessionId,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<AdmissionSlot> {
        let _waiting = WaitingGuard::enter(&self.inner.waiting);
        let permit_fut = self.inner.semaphore.clone().acquire_owned();

        let acquire = async {
            let acquired = match timeout {
                Some(limit) => match tokio::time::timeout(limit, permit_fut).await {
                    Ok(acquired) => acquired,
                    Err(_) => return Err(RuntimeError::AdmissionTimeout { waited: limit }),
                },
                None => permit_fut.await,
            };
            acquired.map_err(|_| RuntimeError::ShuttingDown)
        };

        let acquired = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(RuntimeError::Cancelled),
                acquired = acquire => acquired,
            },
            None => acquire.await,
        };
        let permit = acquired?;

        let slot_id = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        *self.inner.holders.lock().entry(session_id).or_insert(0) += 1;
        debug!("[{}] Admission slot {} granted", session_id, slot_id);

        Ok(AdmissionSlot {
            session_id,
            slot_id,
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    pub fn release(&self, slot: AdmissionSlot) {
        slot.release();
    }

    /// Whether `session_id` currently holds at least one slot
    pub fn is_held(&self, session_id: &SessionId) -> bool {
        self.inner.holders.lock().contains_key(session_id)
    }

    pub fn stats(&self) -> AdmissionStats {
        let active: usize = self.inner.holders.lock().values().sum();
        AdmissionStats {
            active,
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            capacity: self.inner.capacity,
        }
    }

    /// Stop granting slots; current and future waiters get `ShuttingDown`
    pub fn close(&self) {
        if !self.inner.semaphore.is_closed() {
            self.inner.semaphore.close();
            info!("Admission controller closed");
        }
    }
}
