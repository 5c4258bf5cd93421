// SPDX-License-Identifier: MPL-2.0

//! Definitions of page mapping properties.

use bitflags::bitflags;

/// The property of a mapped virtual memory page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageProperty {
    /// The access permissions of the page.
    pub flags: PageFlags,
    /// The cache policy for the page.
    pub cache: CachePolicy,
    pub(crate) priv_flags: PrivilegedPageFlags,
}

impl PageProperty {
    /// Creates a page property for a user-visible page.
    pub fn new_user(flags: PageFlags, cache: CachePolicy) -> Self {
        Self {
            flags,
            cache,
            priv_flags: PrivilegedPageFlags::USER,
        }
    }

    /// Creates a page property with no privileged flags set.
    pub fn new(flags: PageFlags, cache: CachePolicy) -> Self {
        Self {
            flags,
            cache,
            priv_flags: PrivilegedPageFlags::empty(),
        }
    }
}

/// A type to control the cacheability of main memory accesses through a
/// mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Uncacheable. Reads and writes bypass the cache entirely; useful for
    /// memory-mapped I/O where the order of accesses matters.
    Uncacheable,
    /// Write-Combining. Writes may be merged internally by the processor
    /// before reaching memory; useful for framebuffers.
    WriteCombining,
    /// Writethrough. Writes update both the cache line and main memory.
    Writethrough,
    /// Writeback. The "normal" memory policy and the default.
    Writeback,
}

bitflags! {
    /// Page access permissions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Writable.
        const W = 0b0000_0001;
        /// Executable.
        const X = 0b0000_0010;
    }
}

bitflags! {
    /// Page properties that user code cannot choose directly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct PrivilegedPageFlags: u8 {
        /// Accessible from user mode.
        const USER      = 0b0000_0001;
        /// Global page that survives address-space switches in the TLB.
        const GLOBAL    = 0b0000_0010;
    }
}
