//! §4.1 — a process-wide pool of reusable MTU-sized byte buffers, sitting
//! under the broker and tunnel so datagrams on the hot path never allocate.

use bytes::BytesMut;
use parking_lot::Mutex;

/// A pool of fixed-capacity buffers. `get` returns a buffer with undefined
/// contents (callers overwrite it before reading); `put` returns a buffer to
/// the pool. Callers must not retain a reference to a buffer after `put`.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self) -> BytesMut {
        let mut free = self.free.lock();
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.capacity, 0);
                buf
            }
            None => BytesMut::zeroed(self.capacity),
        }
    }

    pub fn put(&self, buf: BytesMut) {
        let mut free = self.free.lock();
        // Bound the pool so a burst of traffic doesn't leave us holding
        // onto an unbounded amount of idle memory.
        if free.len() < 4096 {
            free.push(buf);
        }
    }

    pub fn len_idle(&self) -> usize {
        self.free.lock().len()
    }
}
