use core::{
    fmt::Display,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A unique number identifying an online CPU.
///
/// This is usually but not necessarily the same as the APIC ID.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LogicalCpuId(u32);

impl LogicalCpuId {
    /// The logical CPU ID of the bootstrap processor.
    pub const BSP: Self = Self::new(0);

    /// Creates a new logical CPU ID.
    pub const fn new(inner: u32) -> Self {
        Self(inner)
    }
    /// Returns the inner value of the logical CPU ID.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for LogicalCpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[logical cpu #{}]", self.0)
    }
}
impl Display for LogicalCpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(target_pointer_width = "64")]
pub const MAX_CPU_COUNT: u32 = 128;

#[cfg(target_pointer_width = "32")]
pub const MAX_CPU_COUNT: u32 = 32;

const SET_WORDS: usize = (MAX_CPU_COUNT / usize::BITS) as usize;

/// A bitmask of logical CPU IDs.
///
/// Used as the per-address-space tracking mask: the set of CPUs whose TLB
/// may hold live translations for that space. Membership is tested on the
/// context-switch path without any lock held, so reads are atomic loads
/// rather than the usual `&mut`-based accessors.
#[derive(Debug)]
pub struct LogicalCpuSet([AtomicUsize; SET_WORDS]);

/// Returns the word and bit for a given logical CPU ID.
fn parts(id: LogicalCpuId) -> (usize, u32) {
    ((id.get() / usize::BITS) as usize, id.get() % usize::BITS)
}
impl LogicalCpuSet {
    /// Creates an empty CPU set.
    pub const fn empty() -> Self {
        Self([const { AtomicUsize::new(0) }; SET_WORDS])
    }
    /// Creates a CPU set with all CPUs.
    pub const fn all() -> Self {
        Self([const { AtomicUsize::new(!0) }; SET_WORDS])
    }
    /// Returns true if the set contains the given logical CPU ID.
    ///
    /// Pairs with `atomic_set`/`atomic_clear` from other CPUs; a reader may
    /// observe a stale bit, which callers tolerate by deferring a flush
    /// rather than skipping one.
    pub fn contains(&self, id: LogicalCpuId) -> bool {
        let (word, bit) = parts(id);
        self.0[word].load(Ordering::Acquire) & (1 << bit) != 0
    }
    /// Atomically sets the bit for the given logical CPU ID.
    pub fn atomic_set(&self, id: LogicalCpuId) {
        let (word, bit) = parts(id);
        let _ = self.0[word].fetch_or(1 << bit, Ordering::Release);
    }
    /// Atomically clears the bit for the given logical CPU ID.
    pub fn atomic_clear(&self, id: LogicalCpuId) {
        let (word, bit) = parts(id);
        let _ = self.0[word].fetch_and(!(1 << bit), Ordering::Release);
    }

    /// Returns an iterator over the logical CPU IDs in the set.
    pub fn iter(&self) -> impl Iterator<Item = LogicalCpuId> + '_ {
        self.0.iter().enumerate().flat_map(move |(i, w)| {
            let word = w.load(Ordering::Acquire);
            (0..usize::BITS).filter_map(move |b| {
                if word & (1 << b) != 0 {
                    Some(LogicalCpuId::new(i as u32 * usize::BITS + b))
                } else {
                    None
                }
            })
        })
    }
}
