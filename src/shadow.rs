//! Shadow table manager.
//!
//! Each isolated address space runs user code on a shadow table hierarchy
//! that exposes only a minimal kernel image: entry stubs, per-CPU slots,
//! every task's privileged stack and the debug-store buffers that NMIs
//! touch. This module tracks the per-space shadow tables and the common
//! kernel-side ranges shared by all of them; the page contents themselves
//! are not modeled, only the frames they occupy and the attributes they
//! were mapped with.
//!
//! # Design
//!
//! * Installation is gated: while the record is not activating or active
//!   the manager refuses to build shadows. The host's process-creation
//!   path calls [`install`](ShadowTables::install) unconditionally and the
//!   gate keeps it inert outside a patched window.
//! * Teardown comes in two strengths. Revert uses the best-effort walk and
//!   leaks (with a warning) whatever the host will not give back; the
//!   fresh-installer reset path must be exact and aborts on the first
//!   stuck table.

use alloc::{sync::Arc, vec::Vec};

use hashbrown::HashMap;
use log::{debug, warn};
use spin::Mutex;
use thiserror::Error;

use crate::{
    host::{FrameId, Host, ReleaseError},
    mm::{AddrSpace, AddrSpaceId, TableRoot},
    shared_data::PatchState,
};

bitflags::bitflags! {
    /// Attributes of a range mapped into the kernel side of the shadow
    /// tables.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShadowFlags: u32 {
        const WRITE = 1 << 0;
        const NX = 1 << 1;
        const GLOBAL = 1 << 2;
        const USER = 1 << 3;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("patch is not activating or active")]
    Inactive,
    #[error("out of shadow-table frames")]
    OutOfFrames,
}

/// A range mapped into the common kernel portion shared by every shadow
/// table, together with the page-table frame the mapping consumed.
#[derive(Debug)]
struct MappedRange {
    base: usize,
    size: usize,
    flags: ShadowFlags,
    pt_frame: FrameId,
}

/// One address space's shadow table.
#[derive(Debug)]
struct ShadowSpace {
    mm: Arc<AddrSpace>,
    frame: FrameId,
}

/// Registry of shadow tables and common mappings.
#[derive(Debug)]
pub struct ShadowTables {
    spaces: Mutex<HashMap<AddrSpaceId, ShadowSpace>>,
    common: Mutex<Vec<MappedRange>>,
    #[cfg(test)]
    stuck_table: core::sync::atomic::AtomicBool,
}

impl ShadowTables {
    pub(crate) fn new() -> Self {
        Self {
            spaces: Mutex::new(HashMap::new()),
            common: Mutex::new(Vec::new()),
            #[cfg(test)]
            stuck_table: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Builds (or finds) the shadow table for `mm` and publishes its root
    /// on the space. Denied outside the activating/active window.
    pub(crate) fn install(
        &self,
        state: PatchState,
        host: &Host,
        mm: &Arc<AddrSpace>,
    ) -> Result<TableRoot, MapError> {
        if !matches!(state, PatchState::Activating | PatchState::Active) {
            return Err(MapError::Inactive);
        }
        let mut spaces = self.spaces.lock();
        if let Some(existing) = spaces.get(&mm.id()) {
            return Ok(host.frames().root_of(existing.frame));
        }
        let frame = host.frames().alloc().ok_or(MapError::OutOfFrames)?;
        let root = host.frames().root_of(frame);
        spaces.insert(
            mm.id(),
            ShadowSpace {
                mm: mm.clone(),
                frame,
            },
        );
        // Publish last; switch paths read the root without the registry
        // lock.
        mm.set_user_root(root);
        debug!(
            "shadow table for space {} at {:#x}",
            mm.id().get(),
            root.get()
        );
        Ok(root)
    }

    /// Maps a kernel-side range into the common portion. Idempotent for a
    /// range that is already present.
    pub(crate) fn add_common_mapping(
        &self,
        host: &Host,
        base: usize,
        size: usize,
        flags: ShadowFlags,
    ) -> Result<(), MapError> {
        let mut common = self.common.lock();
        if common.iter().any(|r| r.base == base && r.size == size) {
            return Ok(());
        }
        let pt_frame = host.frames().alloc().ok_or(MapError::OutOfFrames)?;
        common.push(MappedRange {
            base,
            size,
            flags,
            pt_frame,
        });
        Ok(())
    }

    /// Maps every live task's privileged stack.
    pub(crate) fn map_all_thread_stacks(&self, host: &Host) -> Result<(), MapError> {
        for task in host.tasks() {
            let stack = task.kstack();
            self.add_common_mapping(
                host,
                stack.base,
                stack.size,
                ShadowFlags::WRITE | ShadowFlags::NX | ShadowFlags::GLOBAL,
            )?;
        }
        Ok(())
    }

    /// Maps every registered debug-store buffer.
    pub(crate) fn map_all_ds_buffers(&self, host: &Host) -> Result<(), MapError> {
        for buffer in host.ds_buffers() {
            self.add_common_mapping(
                host,
                buffer.base,
                buffer.size,
                ShadowFlags::WRITE | ShadowFlags::NX,
            )?;
        }
        Ok(())
    }

    /// Best-effort teardown of everything, for revert. The phase is never
    /// `Active` here, so no switch path can publish these roots while they
    /// are being torn down; a frame the host refuses to take back is
    /// leaked with a warning.
    pub(crate) fn free_all(&self, host: &Host) {
        let mut spaces = self.spaces.lock();
        let count = spaces.len();
        for (_, space) in spaces.drain() {
            space.mm.clear_user_root();
            if let Err(err) = host.frames().release(space.frame) {
                warn!(
                    "leaking shadow table for space {}: {}",
                    space.mm.id().get(),
                    err
                );
            }
        }
        drop(spaces);
        let mut common = self.common.lock();
        for range in common.drain(..) {
            if let Err(err) = host.frames().release(range.pt_frame) {
                warn!("leaking shadow mapping at {:#x}: {}", range.base, err);
            }
        }
        drop(common);
        debug!("released {} shadow tables", count);
    }

    /// Exact teardown for the fresh-installer reset. Aborts on the first
    /// table that cannot be released, leaving it (and everything after it)
    /// tracked.
    pub(crate) fn release_all_strict(&self, host: &Host) -> Result<(), ReleaseError> {
        #[cfg(test)]
        if self
            .stuck_table
            .load(core::sync::atomic::Ordering::Relaxed)
        {
            return Err(ReleaseError::Busy(FrameId::synthetic(0)));
        }
        let mut spaces = self.spaces.lock();
        let ids: Vec<AddrSpaceId> = spaces.keys().copied().collect();
        for id in ids {
            let Some(space) = spaces.get(&id) else {
                continue;
            };
            // Release first so a failure leaves the entry fully tracked.
            host.frames().release(space.frame)?;
            if let Some(space) = spaces.remove(&id) {
                space.mm.clear_user_root();
            }
        }
        drop(spaces);
        let mut common = self.common.lock();
        while let Some(range) = common.last() {
            host.frames().release(range.pt_frame)?;
            common.pop();
        }
        Ok(())
    }

    pub fn space_count(&self) -> usize {
        self.spaces.lock().len()
    }

    pub fn common_count(&self) -> usize {
        self.common.lock().len()
    }

    pub fn has_space(&self, id: AddrSpaceId) -> bool {
        self.spaces.lock().contains_key(&id)
    }

    /// Models a shadow table the host still holds a reference to, so the
    /// next strict release fails.
    #[cfg(test)]
    pub(crate) fn inject_stuck_table(&self, stuck: bool) {
        self.stuck_table
            .store(stuck, core::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_gated_outside_activation() {
        let host = crate::sim::host(1);
        let tables = ShadowTables::new();
        let mm = Arc::new(AddrSpace::new());
        for state in [
            PatchState::Disabled,
            PatchState::Enabled,
            PatchState::Deactivating,
        ] {
            assert_eq!(
                tables.install(state, &host, &mm),
                Err(MapError::Inactive),
                "install must be denied in {state:?}"
            );
        }
        assert_eq!(mm.user_root(), None);
        assert!(tables.install(PatchState::Activating, &host, &mm).is_ok());
        assert!(mm.user_root().is_some());
    }

    #[test]
    fn test_install_is_idempotent() {
        let host = crate::sim::host(1);
        let tables = ShadowTables::new();
        let mm = Arc::new(AddrSpace::new());
        let first = tables
            .install(PatchState::Active, &host, &mm)
            .expect("install");
        let second = tables
            .install(PatchState::Active, &host, &mm)
            .expect("reinstall");
        assert_eq!(first, second);
        assert_eq!(tables.space_count(), 1);
        assert_eq!(host.frames().outstanding(), 1);
    }

    #[test]
    fn test_common_mapping_dedup() {
        let host = crate::sim::host(1);
        let tables = ShadowTables::new();
        tables
            .add_common_mapping(&host, 0x1000, 0x4000, ShadowFlags::WRITE)
            .expect("map");
        tables
            .add_common_mapping(&host, 0x1000, 0x4000, ShadowFlags::WRITE)
            .expect("remap");
        assert_eq!(tables.common_count(), 1);
        assert_eq!(host.frames().outstanding(), 1);
    }

    #[test]
    fn test_exhaustion_reported() {
        let host = crate::sim::host_with_frames(1, 0);
        let tables = ShadowTables::new();
        let mm = Arc::new(AddrSpace::new());
        assert_eq!(
            tables.install(PatchState::Activating, &host, &mm),
            Err(MapError::OutOfFrames)
        );
        assert_eq!(
            tables.add_common_mapping(&host, 0x1000, 0x1000, ShadowFlags::WRITE),
            Err(MapError::OutOfFrames)
        );
    }

    #[test]
    fn test_free_all_clears_roots_and_frames() {
        let host = crate::sim::host(1);
        let tables = ShadowTables::new();
        let mm = Arc::new(AddrSpace::new());
        tables
            .install(PatchState::Activating, &host, &mm)
            .expect("install");
        tables
            .add_common_mapping(&host, 0x1000, 0x1000, ShadowFlags::WRITE)
            .expect("map");
        tables.free_all(&host);
        assert_eq!(mm.user_root(), None);
        assert_eq!(tables.space_count(), 0);
        assert_eq!(tables.common_count(), 0);
        assert_eq!(host.frames().outstanding(), 0);
    }

    #[test]
    fn test_strict_release_aborts_on_stuck_table() {
        let host = crate::sim::host(1);
        let tables = ShadowTables::new();
        let mm = Arc::new(AddrSpace::new());
        tables
            .install(PatchState::Activating, &host, &mm)
            .expect("install");
        tables.inject_stuck_table(true);
        assert!(tables.release_all_strict(&host).is_err());
        assert_eq!(tables.space_count(), 1, "failed release keeps the entry");
        tables.inject_stuck_table(false);
        tables.release_all_strict(&host).expect("strict release");
        assert_eq!(tables.space_count(), 0);
        assert_eq!(host.frames().outstanding(), 0);
    }
}
