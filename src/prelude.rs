// SPDX-License-Identifier: MPL-2.0

//! The prelude.

pub use crate::mm::{Paddr, Vaddr};

pub(crate) use alloc::{boxed::Box, sync::Arc, vec::Vec};
