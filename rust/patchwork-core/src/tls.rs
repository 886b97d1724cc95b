//! Start-up value for thread-local fixups.
//!
//! Boilerplates that touch the host's thread-local block carry TPOFF32 sites.
//! Their value is the same for every specialization, so the host resolves it
//! once at start-up and installs it here before the first blueprint that
//! needs it is copied.

use std::sync::OnceLock;

static THREAD_LOCAL_BASE: OnceLock<i32> = OnceLock::new();

/// Record the thread-pointer-relative offset of the host's thread-local base.
///
/// Returns `false` if a different offset was already installed.
pub fn install_thread_local_base(offset: i32) -> bool {
    let installed = *THREAD_LOCAL_BASE.get_or_init(|| offset);
    installed == offset
}

/// The installed offset, if any.
pub fn thread_local_base() -> Option<i32> {
    THREAD_LOCAL_BASE.get().copied()
}
