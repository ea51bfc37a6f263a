//! TLB tag leases.
//!
//! x86-64 can tag cached translations with a PCID so that switching address spaces does
//! not have to throw them away. The kernel owns tag 0; processes share the [`NTAGS`] tags
//! above it, handed out round-robin by a global generation counter. A lease stays usable
//! until the counter has moved far enough that its tag may have been handed to someone
//! else. Each core also remembers which generation it last invalidated every tag for, so a
//! lease that moves to a core with older entries under its tag still forces invalidation.

use crate::param::NTAGS;
use spin::mutex::Mutex;

/// Tag the kernel's own address space runs under
pub const KERNEL_TAG: u16 = 0;

/// How an address-space load treats translations cached under its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSwitch {
    pub tag: u16,
    /// Drop everything cached under `tag` before using it
    pub invalidate: bool,
}

impl AddressSwitch {
    /// Load of the kernel's own space
    pub const KERNEL: Self = Self {
        tag: KERNEL_TAG,
        invalidate: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbPolicy {
    /// Reuse translations cached under a still-valid lease
    Tagged,
    /// Invalidate on every switch
    AlwaysInvalidate,
}

impl Default for TlbPolicy {
    fn default() -> Self {
        if cfg!(feature = "pcid") {
            Self::Tagged
        } else {
            Self::AlwaysInvalidate
        }
    }
}

/// A tag handed to one address space, and the generation it was handed out at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLease {
    tag: u16,
    generation: u64,
}

impl TagLease {
    #[must_use]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct TagAllocator {
    policy: TlbPolicy,
    /// Generation the next lease is handed out at
    counter: Mutex<u64>,
}

impl TagAllocator {
    #[must_use]
    pub const fn new(policy: TlbPolicy) -> Self {
        Self {
            policy,
            counter: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn policy(&self) -> TlbPolicy {
        self.policy
    }

    /// Decides how to load an address space holding `lease` on a core whose invalidation
    /// record is `seen`, refreshing the lease and the record as needed.
    pub fn select(
        &self,
        lease: &mut Option<TagLease>,
        seen: &mut [Option<u64>; NTAGS],
    ) -> AddressSwitch {
        if self.policy == TlbPolicy::AlwaysInvalidate {
            *lease = None;
            return AddressSwitch::KERNEL;
        }

        let current = {
            let mut counter = self.counter.lock();
            match *lease {
                Some(held) if *counter - held.generation <= NTAGS as u64 => held,
                _ => {
                    let fresh = TagLease {
                        tag: tag_for(*counter),
                        generation: *counter,
                    };
                    *counter += 1;
                    *lease = Some(fresh);
                    fresh
                }
            }
        };

        let record = &mut seen[usize::from(current.tag) - 1];
        let invalidate = *record != Some(current.generation);
        *record = Some(current.generation);
        AddressSwitch {
            tag: current.tag,
            invalidate,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn tag_for(generation: u64) -> u16 {
    (generation % NTAGS as u64) as u16 + 1
}
