//! Per-CPU cache of the isolated translation roots.
//!
//! Entry and exit stubs read these slots to find the kernel-side and
//! user-side roots for the CPU they run on. The slots are only meaningful
//! while the mitigation is active; in every other phase both stay unset and
//! the plain context switch owns the table-base register alone.
//!
//! # Design
//!
//! * One entry per possible CPU, allocated once up front. Each CPU writes
//!   its own entry from the switch path; cross-CPU writes happen only
//!   inside the synchronous dispatch, which is a full barrier, so the
//!   atomics themselves can stay `Relaxed`.
//! * Zero is the unset sentinel for both root slots, matching the
//!   [`TableRoot`] nonzero invariant.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::{cpu::LogicalCpuId, mm::TableRoot};

/// TLB bookkeeping state of a CPU with respect to its current space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TlbState {
    /// The CPU dropped to lazy tracking; remote shootdowns may pass it by.
    Lazy = 0,
    /// The CPU actively tracks its current space.
    Ok = 1,
}

/// The per-CPU slots consumed by the entry and exit stubs.
#[derive(Debug)]
pub struct PcpuEntry {
    kern_root: AtomicUsize,
    user_root: AtomicUsize,
    tlb_state: AtomicU8,
    user_flush_pending: AtomicBool,
    pcid: AtomicBool,
}

impl PcpuEntry {
    const fn new() -> Self {
        Self {
            kern_root: AtomicUsize::new(0),
            user_root: AtomicUsize::new(0),
            tlb_state: AtomicU8::new(TlbState::Ok as u8),
            user_flush_pending: AtomicBool::new(false),
            pcid: AtomicBool::new(false),
        }
    }

    pub fn kern_root(&self) -> Option<TableRoot> {
        TableRoot::from_raw(self.kern_root.load(Ordering::Relaxed))
    }
    pub fn user_root(&self) -> Option<TableRoot> {
        TableRoot::from_raw(self.user_root.load(Ordering::Relaxed))
    }

    /// Publishes both roots for the current space.
    pub fn set_roots(&self, kern: TableRoot, user: TableRoot) {
        self.kern_root.store(kern.get(), Ordering::Relaxed);
        self.user_root.store(user.get(), Ordering::Relaxed);
    }

    /// Unsets both roots. Entry code falls back to the live register value
    /// and performs no root switch while unset.
    pub fn clear_roots(&self) {
        self.kern_root.store(0, Ordering::Relaxed);
        self.user_root.store(0, Ordering::Relaxed);
    }

    pub fn tlb_state(&self) -> TlbState {
        match self.tlb_state.load(Ordering::Relaxed) {
            0 => TlbState::Lazy,
            _ => TlbState::Ok,
        }
    }
    /// Plain store; the switch path issues its own fence between this store
    /// and the tracking-mask test that follows it.
    pub fn set_tlb_state(&self, state: TlbState) {
        self.tlb_state.store(state as u8, Ordering::Relaxed);
    }

    /// Requests a full user-side TLB reload on the next return to user
    /// mode.
    pub fn request_user_flush(&self) {
        self.user_flush_pending.store(true, Ordering::Relaxed);
    }
    /// Consumes a pending user-side flush request, returning whether one
    /// was pending. Run by the exit stub.
    pub fn take_user_flush(&self) -> bool {
        self.user_flush_pending.swap(false, Ordering::Relaxed)
    }
    pub fn user_flush_pending(&self) -> bool {
        self.user_flush_pending.load(Ordering::Relaxed)
    }

    pub fn enable_pcid(&self) {
        self.pcid.store(true, Ordering::Relaxed);
    }
    pub fn disable_pcid(&self) {
        self.pcid.store(false, Ordering::Relaxed);
    }
    pub fn pcid_enabled(&self) -> bool {
        self.pcid.load(Ordering::Relaxed)
    }

    /// Returns the entry to its inert state.
    pub fn reset(&self) {
        self.clear_roots();
        self.set_tlb_state(TlbState::Ok);
        self.user_flush_pending.store(false, Ordering::Relaxed);
        self.pcid.store(false, Ordering::Relaxed);
    }
}

/// The arena of per-CPU entries, indexed by logical CPU id.
#[derive(Debug)]
pub struct CpuTable {
    entries: Box<[PcpuEntry]>,
}

impl CpuTable {
    pub fn new(cpu_count: u32) -> Self {
        let entries: Vec<PcpuEntry> = (0..cpu_count).map(|_| PcpuEntry::new()).collect();
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    pub fn entry(&self, cpu: LogicalCpuId) -> &PcpuEntry {
        &self.entries[cpu.get() as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogicalCpuId, &PcpuEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (LogicalCpuId::new(i as u32), entry))
    }

    pub fn cpu_count(&self) -> u32 {
        self.entries.len() as u32
    }
}
