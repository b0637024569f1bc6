//! The shared coordination record.
//!
//! Live-patch updates stack: a newer patch module can be loaded while an
//! older one still carries the mitigation, and the pair must hand the
//! machinery over without a window where the machine runs unprotected.
//! Everything whose lifetime spans installations lives here: the lifecycle
//! phase, the pristine interrupt-table snapshot, the per-CPU root caches,
//! the shadow-table registry and the handover bookkeeping. The record is
//! created by the first installation that attaches and persists for the
//! process lifetime.
//!
//! # Locking
//!
//! * `inner` is guarded by a spinlock and holds everything the lifecycle
//!   callbacks negotiate over. Callbacks are serialized by the live-patch
//!   manager, but the fork path races them.
//! * `state` is an atomic read without the lock on every context switch.
//!   Writers hold the lock (the guard-witness parameter on
//!   [`set_state`](SharedData::set_state) enforces that) and publish via
//!   the next cross-CPU dispatch; a reader may briefly see the previous
//!   phase, which every consumer tolerates by falling back to the
//!   unpatched behavior.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use arrayvec::ArrayVec;
use log::debug;
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::{
    host::{Host, ModuleId, ReleaseError},
    idt::{DrainStart, IdtSnapshot},
    mm::{AddrSpace, TableRoot},
    percpu::CpuTable,
    shadow::{MapError, ShadowTables},
};

/// Lifecycle phase of the mitigation, shared by all stacked installations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PatchState {
    /// Nothing may activate. Terminal when the environment gate set it.
    Disabled = 0,
    /// At least one installation is loaded but the mitigation is down.
    Enabled = 1,
    /// An activation is underway: replacement tables are being installed
    /// and the shadow machinery is being built.
    Activating = 2,
    /// The mitigation is live; switch paths publish isolated roots.
    Active = 3,
    /// A revert is underway.
    Deactivating = 4,
}

impl PatchState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Enabled,
            2 => Self::Activating,
            3 => Self::Active,
            4 => Self::Deactivating,
            _ => Self::Disabled,
        }
    }
}

pub const MAX_STACKED_PATCHERS: usize = 8;

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("shadow table release failed: {0}")]
    ShadowRelease(#[from] ReleaseError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("too many stacked installations")]
    TooManyPatchers,
}

/// Mutable core of the record. Every field requires the record lock.
#[derive(Debug, Default)]
pub struct SharedInner {
    /// Set by revert; a later activation must reset the record before it
    /// may reuse it.
    pub(crate) dirty: bool,
    /// Byte copy of the interrupt table the first installer found. Present
    /// from first activation until a reset discards it.
    pub(crate) orig_idt: Option<IdtSnapshot>,
    /// Drain-start handle a predecessor published on replace, waiting for
    /// its successor to take it.
    pub(crate) prev_drain_start: Option<DrainStart>,
    patchers: ArrayVec<ModuleId, MAX_STACKED_PATCHERS>,
}

impl SharedInner {
    pub(crate) fn register_patcher(&mut self, module: ModuleId) -> Result<(), RegisterError> {
        if self.patchers.contains(&module) {
            return Ok(());
        }
        self.patchers
            .try_push(module)
            .map_err(|_| RegisterError::TooManyPatchers)
    }

    pub(crate) fn unregister_patcher(&mut self, module: ModuleId) {
        self.patchers.retain(|m| *m != module);
    }

    /// Whether `module` is a loaded installation of this same mitigation.
    /// Replace callbacks use this to tell a successor from an unrelated
    /// patch.
    pub fn is_patcher(&self, module: ModuleId) -> bool {
        self.patchers.contains(&module)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// The record itself. Reached through [`SharedData::attach`]; never
/// dropped once created.
#[derive(Debug)]
pub struct SharedData {
    state: AtomicU8,
    percpu: CpuTable,
    shadow: ShadowTables,
    inner: Mutex<SharedInner>,
}

impl SharedData {
    fn new(cpu_count: u32) -> Self {
        Self {
            state: AtomicU8::new(PatchState::Disabled as u8),
            percpu: CpuTable::new(cpu_count),
            shadow: ShadowTables::new(),
            inner: Mutex::new(SharedInner::default()),
        }
    }

    /// Returns the process-wide record, creating it on first attach.
    pub fn attach(host: &Host) -> Arc<SharedData> {
        host.shared_slot()
            .call_once(|| Arc::new(SharedData::new(host.cpu_count())))
            .clone()
    }

    /// Current phase, read without the lock. May lag a transition in
    /// flight on another CPU; consumers treat any non-`Active` answer as
    /// "stand down", which is correct in either direction of the race.
    pub fn state(&self) -> PatchState {
        PatchState::from_raw(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Relaxed) == PatchState::Active as u8
    }

    pub fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock()
    }

    /// Moves the phase. The guard parameter is the record lock held by the
    /// caller; global visibility comes from the next dispatch, not from
    /// this store.
    pub fn set_state(&self, _inner: &mut SharedInner, state: PatchState) {
        let old = self.state();
        self.state.store(state as u8, Ordering::Relaxed);
        debug!("patch state {:?} -> {:?}", old, state);
    }

    pub fn percpu(&self) -> &CpuTable {
        &self.percpu
    }

    pub fn shadow(&self) -> &ShadowTables {
        &self.shadow
    }

    /// Shadow-table install for the host's process-creation path; gated by
    /// the current phase.
    pub fn install_shadow(&self, host: &Host, mm: &Arc<AddrSpace>) -> Result<TableRoot, MapError> {
        self.shadow.install(self.state(), host, mm)
    }

    pub(crate) fn map_all_thread_stacks(&self, host: &Host) -> Result<(), MapError> {
        self.shadow.map_all_thread_stacks(host)
    }

    pub(crate) fn map_all_ds_buffers(&self, host: &Host) -> Result<(), MapError> {
        self.shadow.map_all_ds_buffers(host)
    }

    /// Returns the record to a pristine state for a fresh installer after
    /// an unclean handover. Fails without touching the snapshot or the
    /// dirty flag if any shadow table cannot be released; that failure is
    /// permanent for the process lifetime.
    pub fn reset(&self, inner: &mut SharedInner, host: &Host) -> Result<(), ResetError> {
        self.shadow.release_all_strict(host)?;
        inner.orig_idt = None;
        // A handle could only linger here if its owner died unclean; the
        // drain must not fire into an unloaded module.
        inner.prev_drain_start = None;
        inner.dirty = false;
        debug!("shared record reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_returns_one_record() {
        let host = crate::sim::host(2);
        let a = SharedData::attach(&host);
        let b = SharedData::attach(&host);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), PatchState::Disabled);
    }

    #[test]
    fn test_state_transitions_visible() {
        let host = crate::sim::host(1);
        let shared = SharedData::attach(&host);
        let mut inner = shared.lock();
        shared.set_state(&mut inner, PatchState::Enabled);
        drop(inner);
        assert_eq!(shared.state(), PatchState::Enabled);
        assert!(!shared.is_active());
        let mut inner = shared.lock();
        shared.set_state(&mut inner, PatchState::Active);
        drop(inner);
        assert!(shared.is_active());
    }

    #[test]
    fn test_patcher_registry() {
        let mut inner = SharedInner::default();
        let a = ModuleId::next();
        let b = ModuleId::next();
        inner.register_patcher(a).expect("register");
        assert!(inner.is_patcher(a));
        assert!(!inner.is_patcher(b));
        inner.register_patcher(a).expect("idempotent register");
        inner.unregister_patcher(a);
        assert!(!inner.is_patcher(a));
    }

    #[test]
    fn test_patcher_registry_overflow() {
        let mut inner = SharedInner::default();
        for _ in 0..MAX_STACKED_PATCHERS {
            inner.register_patcher(ModuleId::next()).expect("register");
        }
        assert_eq!(
            inner.register_patcher(ModuleId::next()),
            Err(RegisterError::TooManyPatchers)
        );
    }

    #[test]
    fn test_reset_clears_handover_state() {
        let host = crate::sim::host(1);
        let shared = SharedData::attach(&host);
        let entry = crate::idt::EntryTable::new(ModuleId::next());
        {
            let mut inner = shared.lock();
            inner.dirty = true;
            inner.orig_idt = Some(IdtSnapshot::capture(&crate::idt::IdtImage::boot()));
            inner.prev_drain_start = Some(entry.drain_start_handle());
        }
        let mut inner = shared.lock();
        shared.reset(&mut inner, &host).expect("reset");
        assert!(!inner.dirty);
        assert!(inner.orig_idt.is_none());
        assert!(inner.prev_drain_start.is_none());
        // The unused handle must not have started the drain.
        assert_eq!(entry.drain().start_count(), 0);
    }
}
