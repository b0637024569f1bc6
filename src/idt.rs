//! Interrupt-table images and per-installation entry state.
//!
//! The patch replaces the interrupt descriptor table wholesale so that
//! every kernel entry lands in stubs that perform the root switch. What
//! those stubs do is outside this crate; here a table is an opaque,
//! byte-comparable image. What matters for the lifecycle is byte-for-byte
//! restoration on revert and a single snapshot of the pristine table shared
//! by all stacked installations.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::host::ModuleId;

pub const IDT_VECTORS: usize = 256;
pub const GATE_SIZE: usize = 16;
pub const IDT_SIZE: usize = IDT_VECTORS * GATE_SIZE;

const KERNEL_CS: u16 = 0x10;
const HANDLER_STRIDE: usize = 16;

const BOOT_STUB_BASE: usize = 0xffff_ffff_8100_0000;
const REPL_STUB_BASE: usize = 0xffff_ffff_a000_0000;

/// A complete interrupt descriptor table, 256 16-byte gates.
#[derive(Clone, PartialEq, Eq)]
pub struct IdtImage {
    gates: Box<[u8]>,
}

impl IdtImage {
    /// Builds a table whose gates point at consecutive entry stubs starting
    /// at `base`, in the 64-bit gate descriptor layout.
    fn with_stub_base(base: usize) -> Self {
        let mut gates = alloc::vec![0u8; IDT_SIZE].into_boxed_slice();
        for vector in 0..IDT_VECTORS {
            let offset = base + vector * HANDLER_STRIDE;
            let gate = &mut gates[vector * GATE_SIZE..][..GATE_SIZE];
            gate[0..2].copy_from_slice(&((offset & 0xffff) as u16).to_le_bytes());
            gate[2..4].copy_from_slice(&KERNEL_CS.to_le_bytes());
            gate[4] = 0; // no IST
            gate[5] = 0x8e; // present, DPL 0, interrupt gate
            gate[6..8].copy_from_slice(&(((offset >> 16) & 0xffff) as u16).to_le_bytes());
            gate[8..12].copy_from_slice(&(((offset >> 32) & 0xffff_ffff) as u32).to_le_bytes());
        }
        Self { gates }
    }

    /// The machine's pristine boot-time table.
    pub fn boot() -> Self {
        Self::with_stub_base(BOOT_STUB_BASE)
    }

    /// The replacement table carried by one installation. Each module's
    /// stubs live in its own mapping, so the image differs per module.
    pub fn for_module(module: ModuleId) -> Self {
        Self::with_stub_base(REPL_STUB_BASE + (module.get() << 16))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            gates: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.gates
    }
}

impl core::fmt::Debug for IdtImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IdtImage({} bytes)", self.gates.len())
    }
}

/// Byte copy of the table that was live before the first installation took
/// over. Captured once; held in the shared record until a reset discards
/// it; restored verbatim on revert.
#[derive(Clone, PartialEq, Eq)]
pub struct IdtSnapshot {
    bytes: Vec<u8>,
}

impl IdtSnapshot {
    pub fn capture(image: &IdtImage) -> Self {
        Self {
            bytes: image.as_bytes().to_vec(),
        }
    }

    pub fn to_image(&self) -> IdtImage {
        IdtImage::from_bytes(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl core::fmt::Debug for IdtSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IdtSnapshot({} bytes)", self.bytes.len())
    }
}

/// Drain state of one installation's entry stubs.
///
/// Draining means the stubs route new entries through their successor (or
/// the restored table) and only finish in-flight users, after which the
/// module can be unloaded.
#[derive(Debug, Default)]
pub struct EntryDrain {
    draining: AtomicBool,
    starts: AtomicUsize,
}

impl EntryDrain {
    pub const fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }
    }

    /// Flags the stubs as draining without kicking the drain itself.
    /// Used on the replace path, where the successor decides when the
    /// predecessor may actually wind down.
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Starts the drain.
    pub fn begin(&self) {
        self.draining.store(true, Ordering::Release);
        self.starts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// How many times the drain was started. More than once indicates a
    /// broken handover.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Acquire)
    }
}

/// Move-only handle that starts a predecessor's drain.
///
/// The predecessor publishes one of these into the shared record on
/// replace; the successor takes it out and consumes it once it is live.
/// Consuming `self` makes double-start unrepresentable.
#[derive(Debug)]
pub struct DrainStart {
    drain: Arc<EntryDrain>,
}

impl DrainStart {
    pub(crate) fn new(drain: Arc<EntryDrain>) -> Self {
        Self { drain }
    }

    pub fn begin(self) {
        self.drain.begin();
    }
}

/// Per-installation entry-table state: the replacement image plus the
/// drain bookkeeping for this module's stubs.
#[derive(Debug)]
pub struct EntryTable {
    image: Arc<IdtImage>,
    drain: Arc<EntryDrain>,
}

impl EntryTable {
    pub fn new(module: ModuleId) -> Self {
        Self {
            image: Arc::new(IdtImage::for_module(module)),
            drain: Arc::new(EntryDrain::new()),
        }
    }

    pub fn image(&self) -> &Arc<IdtImage> {
        &self.image
    }

    pub fn drain(&self) -> &EntryDrain {
        &self.drain
    }

    pub fn drain_start_handle(&self) -> DrainStart {
        DrainStart::new(self.drain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_image_is_deterministic() {
        assert_eq!(IdtImage::boot().as_bytes(), IdtImage::boot().as_bytes());
    }

    #[test]
    fn test_module_images_differ() {
        let a = IdtImage::for_module(ModuleId::next());
        let b = IdtImage::for_module(ModuleId::next());
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), IdtImage::boot().as_bytes());
    }

    #[test]
    fn test_gate_layout() {
        let image = IdtImage::boot();
        let gate = &image.as_bytes()[..GATE_SIZE];
        assert_eq!(u16::from_le_bytes([gate[2], gate[3]]), KERNEL_CS);
        assert_eq!(gate[5], 0x8e);
        // Vector 0 offset low word matches the stub base.
        assert_eq!(
            u16::from_le_bytes([gate[0], gate[1]]) as usize,
            BOOT_STUB_BASE & 0xffff
        );
    }

    #[test]
    fn test_snapshot_restores_bytes() {
        let image = IdtImage::for_module(ModuleId::next());
        let snapshot = IdtSnapshot::capture(&image);
        assert_eq!(snapshot.to_image().as_bytes(), image.as_bytes());
    }

    #[test]
    fn test_drain_start_counts_once() {
        let entry = EntryTable::new(ModuleId::next());
        assert!(!entry.drain().is_draining());
        let handle = entry.drain_start_handle();
        entry.drain().mark_draining();
        assert!(entry.drain().is_draining());
        assert_eq!(entry.drain().start_count(), 0);
        handle.begin();
        assert_eq!(entry.drain().start_count(), 1);
    }
}
