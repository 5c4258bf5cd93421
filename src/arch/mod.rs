// SPDX-License-Identifier: MPL-2.0

//! Platform-specific code.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) mod x86;
        pub(crate) use self::x86::{cpu, mm};
    } else {
        compile_error!("unsupported target architecture");
    }
}
