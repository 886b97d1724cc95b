//! Thread-pointer arithmetic for resolving thread-local fixups at start-up.
//!
//! On x86-64 Linux the local-exec TLS model addresses a thread-local as
//! `%fs:offset`, where `offset` is the (negative) distance from the thread
//! pointer to the variable. The host computes that offset once for its
//! thread-local base and installs it with
//! [`patchwork_core::tls::install_thread_local_base`].

/// The current thread pointer (`%fs:0`).
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: on x86-64 Linux `%fs:0` holds the thread control block's self
    // pointer and is always mapped.
    unsafe {
        std::arch::asm!(
            "mov {}, qword ptr fs:[0]",
            out(reg) tp,
            options(nostack, readonly, preserves_flags)
        );
    }
    tp
}

/// Offset of `addr` from the thread pointer, if it fits a TPOFF32 field.
///
/// Only meaningful for variables in the executable's static TLS block.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn thread_pointer_offset(addr: *const u8) -> Option<i32> {
    let delta = (addr as isize).wrapping_sub(thread_pointer() as isize);
    i32::try_from(delta).ok()
}

/// Compute and install the thread-local base offset for `addr`.
///
/// Returns `false` if the offset does not fit or a different one was
/// already installed.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub fn install_from_address(addr: *const u8) -> bool {
    match thread_pointer_offset(addr) {
        Some(offset) => patchwork_core::tls::install_thread_local_base(offset),
        None => false,
    }
}

#[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static SLOT: Cell<u64> = const { Cell::new(0) };
    }

    #[test]
    fn offset_points_back_at_variable() {
        let addr = SLOT.with(|s| s as *const Cell<u64> as *const u8);
        let offset = thread_pointer_offset(addr).expect("static TLS within 2 GiB of tp");
        assert_eq!(
            thread_pointer().wrapping_add_signed(offset as isize),
            addr as usize
        );
    }
}
