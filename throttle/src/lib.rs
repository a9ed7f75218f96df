//! Blocking resource throttles for the parallel transfer pool (C9).
//!
//! The transfer pool dispatches work to real OS threads that make blocking
//! I/O calls, so the throttles here block the calling thread rather than
//! yielding to an async executor (contrast with the ambient `tokio::sync`
//! primitives used elsewhere in this workspace for the database connection
//! and remote capability).

mod semaphore;

use std::sync::OnceLock;

static OPEN_FILES_LIMIT: OnceLock<semaphore::Semaphore> = OnceLock::new();

fn open_files_limit() -> &'static semaphore::Semaphore {
    OPEN_FILES_LIMIT.get_or_init(semaphore::Semaphore::new)
}

/// Configure the maximum number of files the transfer pool may hold open at
/// once. `0` disables the limit.
pub fn set_max_open_files(max_open_files: usize) {
    open_files_limit().setup(max_open_files);
}

/// RAII guard: releases the open-file permit on drop.
pub struct OpenFileGuard {
    _private: (),
}

impl Drop for OpenFileGuard {
    fn drop(&mut self) {
        open_files_limit().release();
    }
}

/// Blocks until a file-descriptor permit is available.
pub fn open_file_permit() -> OpenFileGuard {
    open_files_limit().acquire();
    OpenFileGuard { _private: () }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_on_drop() {
        set_max_open_files(1);
        let g1 = open_file_permit();
        drop(g1);
        let _g2 = open_file_permit();
    }
}
