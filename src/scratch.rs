// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::var_int_buffer::VarIntBuffer;
use std::cell::RefCell;

/// Per-thread rewrite scratch: one value-stream backing buffer and one
/// offset-stream buffer, lazily allocated on a worker's first split and
/// reused for every split that worker performs afterwards.
#[derive(Default)]
pub struct ScratchBuffers {
    /// Backing words for a temporary compact vector.
    pub values: Vec<u64>,
    /// Temporary offset stream.
    pub offsets: VarIntBuffer,
}

thread_local! {
    static SCRATCH: RefCell<ScratchBuffers> = RefCell::new(ScratchBuffers::default());
}

/// Runs `f` with this thread's scratch buffers.
pub fn with_scratch<R>(f: impl FnOnce(&mut ScratchBuffers) -> R) -> R {
    SCRATCH.with(|cell| f(&mut cell.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::with_scratch;
    use test_log::test;

    #[test]
    fn scratch_persists_within_a_thread() {
        with_scratch(|scratch| {
            scratch.values.resize(100, 7);
        });

        with_scratch(|scratch| {
            assert!(scratch.values.capacity() >= 100);
        });
    }
}
