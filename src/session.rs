//! Transcoding sessions and the table that hands out their handles
//!
//! A session is created fully initialized (input open, codecs and muxer
//! configured) and parked in the [`SessionTable`] until the caller runs it.
//! The table is small and every operation scans it under one lock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AvpipeError, Result};
use crate::transcode::TxStats;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One flag per coder side; either being set stops the pump.
#[derive(Debug, Clone, Default)]
pub struct CancelFlags {
    pub decoder: CancelToken,
    pub encoder: CancelToken,
}

impl CancelFlags {
    pub fn cancel(&self) {
        self.decoder.cancel();
        self.encoder.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.decoder.is_cancelled() || self.encoder.is_cancelled()
    }
}

/// Work owned by a session, consumed by its single run.
pub trait TxJob: Send {
    fn run(&mut self, cancel: &CancelFlags) -> Result<TxStats>;
}

/// An initialized transcoding session
pub struct TxSession {
    label: String,
    handle: AtomicI32,
    index: AtomicIsize,
    cancel: CancelFlags,
    job: Mutex<Option<Box<dyn TxJob>>>,
}

impl TxSession {
    pub fn new(label: impl Into<String>, job: Box<dyn TxJob>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            handle: AtomicI32::new(0),
            index: AtomicIsize::new(-1),
            cancel: CancelFlags::default(),
            job: Mutex::new(Some(job)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Handle assigned by the table, 0 before registration.
    pub fn handle(&self) -> i32 {
        self.handle.load(Ordering::SeqCst)
    }

    /// Slot index recorded at registration, -1 before.
    pub fn index(&self) -> isize {
        self.index.load(Ordering::SeqCst)
    }

    pub fn cancel_flags(&self) -> &CancelFlags {
        &self.cancel
    }

    pub fn is_finalized(&self) -> bool {
        self.job.lock().is_none()
    }

    /// Run the session's job once. The job is released afterwards whatever
    /// the outcome.
    pub fn run(&self) -> Result<TxStats> {
        self.try_run().unwrap_or_else(|| {
            Err(AvpipeError::Consistency(format!(
                "session {} already ran",
                self.label
            )))
        })
    }

    /// `None` when another caller already took the job.
    pub fn try_run(&self) -> Option<Result<TxStats>> {
        let mut job = self.job.lock().take()?;
        let result = job.run(&self.cancel);
        drop(job);
        Some(result)
    }

    /// Release everything the session owns. Safe to call repeatedly.
    pub fn fini(&self) {
        if let Some(job) = self.job.lock().take() {
            tracing::debug!(label = %self.label, handle = self.handle(), "session finalized");
            drop(job);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_index(&self, index: isize) {
        self.index.store(index, Ordering::SeqCst);
    }
}

struct Entry {
    handle: i32,
    session: Arc<TxSession>,
}

enum Slot {
    Free,
    /// Held by a [`Reservation`] while its session is being built
    Reserved,
    Live(Entry),
}

impl Slot {
    fn entry(&self) -> Option<&Entry> {
        match self {
            Slot::Live(entry) => Some(entry),
            _ => None,
        }
    }
}

/// A slot claimed before the session exists; released again on drop unless
/// [`Reservation::install`] fills it.
pub struct Reservation<'a> {
    table: &'a SessionTable,
    index: usize,
    installed: bool,
}

impl Reservation<'_> {
    /// Place `session` in the reserved slot and return its handle.
    pub fn install(mut self, session: Arc<TxSession>) -> Result<i32> {
        let mut slots = self.table.slots.lock();
        if !matches!(slots.get(self.index), Some(Slot::Reserved)) {
            return Err(AvpipeError::Consistency(format!(
                "slot {} is no longer reserved",
                self.index
            )));
        }

        let handle = loop {
            let candidate = (rand::random::<u32>() & 0x7fff_ffff) as i32;
            if candidate != 0
                && !slots
                    .iter()
                    .filter_map(Slot::entry)
                    .any(|e| e.handle == candidate)
            {
                break candidate;
            }
        };

        session.handle.store(handle, Ordering::SeqCst);
        session.index.store(self.index as isize, Ordering::SeqCst);
        tracing::debug!(handle, index = self.index, label = %session.label, "session registered");
        slots[self.index] = Slot::Live(Entry { handle, session });
        self.installed = true;
        Ok(handle)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.installed {
            return;
        }
        let mut slots = self.table.slots.lock();
        if let Some(slot) = slots.get_mut(self.index) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Free;
                tracing::debug!(index = self.index, "session slot reservation released");
            }
        }
    }
}

/// Fixed-capacity registry of live sessions
pub struct SessionTable {
    slots: Mutex<Vec<Slot>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Free);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter_map(Slot::entry).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the first free slot, failing with `Capacity` when there is none.
    pub fn reserve(&self) -> Result<Reservation<'_>> {
        let mut slots = self.slots.lock();
        let capacity = slots.len();
        let Some(index) = slots.iter().position(|s| matches!(s, Slot::Free)) else {
            tracing::warn!(capacity, "session table full");
            return Err(AvpipeError::Capacity { capacity });
        };
        slots[index] = Slot::Reserved;
        Ok(Reservation {
            table: self,
            index,
            installed: false,
        })
    }

    /// Register `session` in the first free slot and return its handle.
    pub fn put(&self, session: Arc<TxSession>) -> Result<i32> {
        self.reserve()?.install(session)
    }

    pub fn find(&self, handle: i32) -> Result<Arc<TxSession>> {
        self.slots
            .lock()
            .iter()
            .filter_map(Slot::entry)
            .find(|e| e.handle == handle)
            .map(|e| e.session.clone())
            .ok_or(AvpipeError::SessionNotFound(handle))
    }

    /// Run the session for `handle`, then free and finalize it.
    ///
    /// A caller that finds the job already taken gets `Consistency` and
    /// leaves the entry alone, so the running session stays cancellable.
    pub fn run(&self, handle: i32) -> Result<TxStats> {
        let session = self.find(handle)?;
        let Some(result) = session.try_run() else {
            tracing::warn!(handle, "session is already running or finished");
            return Err(AvpipeError::Consistency(format!(
                "session {} is already running",
                handle
            )));
        };
        if let Err(e) = self.free(handle) {
            tracing::error!(handle, error = %e, "failed to free session");
        }
        session.fini();
        result
    }

    /// Request cancellation; returns without waiting for the pump.
    pub fn cancel(&self, handle: i32) -> Result<()> {
        let slots = self.slots.lock();
        for (i, slot) in slots.iter().enumerate() {
            let Some(entry) = slot.entry() else { continue };
            if entry.handle != handle {
                continue;
            }
            let recorded = entry.session.index();
            if recorded != i as isize {
                tracing::error!(handle, recorded, slot = i, "session table corrupted on cancel");
                return Err(AvpipeError::Consistency(format!(
                    "cancel: handle {} recorded index {} but sits at {}",
                    handle, recorded, i
                )));
            }
            entry.session.cancel.cancel();
            tracing::info!(handle, "session cancel requested");
            return Ok(());
        }
        Err(AvpipeError::SessionNotFound(handle))
    }

    /// Remove the entry for `handle`; refused when its slot does not match.
    pub fn free(&self, handle: i32) -> Result<()> {
        let mut slots = self.slots.lock();
        for i in 0..slots.len() {
            let recorded = match &slots[i] {
                Slot::Live(entry) if entry.handle == handle => entry.session.index(),
                _ => continue,
            };
            if recorded != i as isize {
                tracing::error!(handle, recorded, slot = i, "session table corrupted on free");
                return Err(AvpipeError::Consistency(format!(
                    "free: handle {} recorded index {} but sits at {}",
                    handle, recorded, i
                )));
            }
            slots[i] = Slot::Free;
            tracing::debug!(handle, index = i, "session freed");
            return Ok(());
        }
        Err(AvpipeError::SessionNotFound(handle))
    }
}
