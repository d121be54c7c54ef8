use core::ptr;

/// Fixed-capacity FIFO of u16 indices over externally owned storage.
///
/// The pool keeps its free slots and free metadata records in these, so
/// the index that has waited longest is always the next one handed out.
pub struct IndexQueue {
    buf: *mut u16,
    capacity: usize,
    head: usize,
    len: usize,
}

// The storage is owned by the pool, which only touches a queue under its lock.
unsafe impl Send for IndexQueue {}

impl IndexQueue {
    pub const fn empty() -> Self {
        IndexQueue {
            buf: ptr::null_mut(),
            capacity: 0,
            head: 0,
            len: 0,
        }
    }

    /// A queue holding `0, 1, .., capacity - 1` in that order.
    ///
    /// # Safety
    /// `buf` must be valid for `capacity` u16 writes for as long as the
    /// queue is used.
    pub unsafe fn new_filled(buf: *mut u16, capacity: usize) -> Self {
        debug_assert!(capacity <= u16::MAX as usize);
        for i in 0..capacity {
            buf.add(i).write(i as u16);
        }
        IndexQueue {
            buf,
            capacity,
            head: 0,
            len: capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take the index that has been queued the longest.
    pub fn pop_front(&mut self) -> Option<u16> {
        if self.len == 0 {
            return None;
        }
        let idx = unsafe { self.buf.add(self.head).read() };
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(idx)
    }

    /// Queue an index behind everything already waiting.
    pub fn push_back(&mut self, idx: u16) {
        assert!(self.len < self.capacity, "index queue overflow");
        let tail = (self.head + self.len) % self.capacity;
        unsafe { self.buf.add(tail).write(idx) };
        self.len += 1;
    }

    /// Put an index back at the front, undoing a `pop_front`.
    pub fn push_front(&mut self, idx: u16) {
        assert!(self.len < self.capacity, "index queue overflow");
        self.head = (self.head + self.capacity - 1) % self.capacity;
        unsafe { self.buf.add(self.head).write(idx) };
        self.len += 1;
    }
}
