//! Process-wide cell-buffer pool.
//!
//! Rebuilds are allocation-heavy; the pool recycles cell buffers across
//! commits instead of round-tripping them through the heap. Only buffers
//! up to [`MAX_POOLED_CAPACITY`] are retained; oversized ones are simply
//! dropped.

use std::sync::{Mutex, OnceLock};

/// Largest buffer capacity the pool retains.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Number of buffers kept at rest.
const MAX_POOLED_BUFFERS: usize = 4;

static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// Takes a cleared buffer from the pool, reserving at least
/// `capacity_hint` bytes.
pub fn get(capacity_hint: usize) -> Vec<u8> {
    let mut buf = pool()
        .lock()
        .expect("buffer pool lock poisoned")
        .pop()
        .unwrap_or_default();

    buf.clear();
    if buf.capacity() < capacity_hint {
        buf.reserve(capacity_hint - buf.capacity());
    }
    buf
}

/// Returns a buffer to the pool; buffers over the retention cap are
/// dropped.
pub fn put(buf: Vec<u8>) {
    if buf.capacity() == 0 || buf.capacity() > MAX_POOLED_CAPACITY {
        return;
    }

    let mut guard = pool().lock().expect("buffer pool lock poisoned");
    if guard.len() < MAX_POOLED_BUFFERS {
        guard.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_cleared_buffer() {
        let mut buf = get(64);
        buf.extend_from_slice(&[1, 2, 3]);
        put(buf);

        let buf = get(0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_hint_is_reserved() {
        let buf = get(8192);
        assert!(buf.capacity() >= 8192);
        put(buf);
    }

    #[test]
    fn test_oversized_buffers_are_dropped() {
        // Should not panic; the buffer is silently released.
        put(Vec::with_capacity(MAX_POOLED_CAPACITY + 1));
    }
}
