//! Address-space model.
//!
//! The patch never owns an address space; it decorates spaces the host
//! kernel already manages with one extra slot, the user-visible shadow
//! table root. The slot is atomic because it is installed by whichever CPU
//! runs the activation or the fork path and read by every CPU's context
//! switch.

use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::cpu::LogicalCpuSet;

pub const PAGE_SIZE: usize = 4096;

/// Physical root of a translation-table hierarchy, as loaded into the
/// table-base register. Never zero; zero is the "unset" sentinel in the
/// atomic slots that cache roots.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TableRoot(NonZeroUsize);

impl TableRoot {
    pub const fn new(addr: NonZeroUsize) -> Self {
        Self(addr)
    }
    /// Wraps a raw root value, `None` for the unset sentinel.
    pub fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

/// A unique number identifying an address space for the lifetime of the
/// process. Identifiers are never reused, so a stale cached id can only
/// miscompare, never alias.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct AddrSpaceId(NonZeroUsize);

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

impl AddrSpaceId {
    fn next() -> Self {
        let raw = NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed);
        // Fresh ids start at 1, so the counter value is always nonzero.
        Self(NonZeroUsize::new(raw).unwrap_or(NonZeroUsize::MIN))
    }
    /// Rebuilds an id from a raw cached value, `None` for the zero
    /// sentinel.
    pub(crate) fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

/// An address space (an `mm` in host-kernel terms).
///
/// `kern_root` is the space's ordinary translation root and exists for the
/// space's whole life. `user_root` is the shadow root, present only while
/// a shadow table is installed for this space; it holds the raw root value
/// or zero.
#[derive(Debug)]
pub struct AddrSpace {
    id: AddrSpaceId,
    kern_root: TableRoot,
    user_root: AtomicUsize,
    /// CPUs whose TLB may cache translations of this space.
    cpus: LogicalCpuSet,
}

/// Synthetic base for kernel translation roots. Spaces are modeled, not
/// backed by real page frames, so roots only need to be distinct nonzero
/// register-width values.
const KERN_ROOT_BASE: usize = 0x4000_0000;

impl AddrSpace {
    pub fn new() -> Self {
        let id = AddrSpaceId::next();
        let root = KERN_ROOT_BASE + id.get() * PAGE_SIZE;
        Self {
            id,
            // KERN_ROOT_BASE is nonzero and ids only grow.
            kern_root: TableRoot(NonZeroUsize::new(root).unwrap_or(NonZeroUsize::MIN)),
            user_root: AtomicUsize::new(0),
            cpus: LogicalCpuSet::empty(),
        }
    }

    pub fn id(&self) -> AddrSpaceId {
        self.id
    }
    pub fn kern_root(&self) -> TableRoot {
        self.kern_root
    }
    pub fn cpus(&self) -> &LogicalCpuSet {
        &self.cpus
    }

    /// The shadow root, if a shadow table is installed.
    ///
    /// Acquire pairs with the Release in [`Self::set_user_root`]: a reader
    /// that sees the root also sees the shadow table contents built before
    /// it was published.
    pub fn user_root(&self) -> Option<TableRoot> {
        TableRoot::from_raw(self.user_root.load(Ordering::Acquire))
    }
    pub fn set_user_root(&self, root: TableRoot) {
        self.user_root.store(root.get(), Ordering::Release);
    }
    pub fn clear_user_root(&self) {
        self.user_root.store(0, Ordering::Release);
    }
}

impl Default for AddrSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = AddrSpace::new();
        let b = AddrSpace::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.kern_root(), b.kern_root());
    }

    #[test]
    fn test_user_root_starts_unset() {
        let space = AddrSpace::new();
        assert_eq!(space.user_root(), None);
    }

    #[test]
    fn test_user_root_roundtrip() {
        let space = AddrSpace::new();
        let root = TableRoot::from_raw(0x9000_1000).expect("nonzero");
        space.set_user_root(root);
        assert_eq!(space.user_root(), Some(root));
        space.clear_user_root();
        assert_eq!(space.user_root(), None);
    }
}
