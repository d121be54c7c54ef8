//! Bounded strings for crash reporting.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// A string with inline capacity `N`. Writes past the capacity are
/// truncated at a character boundary instead of failing, so formatting
/// into it never allocates and never errors.
#[derive(Clone, Copy)]
pub struct FixedString<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedString<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only whole UTF-8 characters are ever copied in.
        unsafe { core::str::from_utf8_unchecked(&self.buf[..self.len]) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push_str(&mut self, s: &str) {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedString<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

const UNSET: u8 = 0;
const WRITING: u8 = 1;
const SET: u8 = 2;

/// A named crash annotation that is written once and read by the crash
/// reporter. Values longer than `N` bytes are truncated.
pub struct CrashKeyString<const N: usize> {
    name: &'static str,
    state: AtomicU8,
    len: AtomicUsize,
    value: UnsafeCell<[u8; N]>,
}

// `value` is written only by the thread that wins UNSET -> WRITING and read
// only after SET is observed.
unsafe impl<const N: usize> Sync for CrashKeyString<N> {}

impl<const N: usize> CrashKeyString<N> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(UNSET),
            len: AtomicUsize::new(0),
            value: UnsafeCell::new([0; N]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the value. Returns false if it was already set.
    pub fn set(&self, value: &str) -> bool {
        if self
            .state
            .compare_exchange(UNSET, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let mut fixed = FixedString::<N>::new();
        fixed.push_str(value);
        unsafe {
            (&mut *self.value.get())[..fixed.len()].copy_from_slice(fixed.as_bytes());
        }
        self.len.store(fixed.len(), Ordering::Relaxed);
        self.state.store(SET, Ordering::Release);
        true
    }

    pub fn get(&self) -> Option<&str> {
        if self.state.load(Ordering::Acquire) != SET {
            return None;
        }
        let len = self.len.load(Ordering::Relaxed);
        let bytes = unsafe { &(&*self.value.get())[..len] };
        Some(unsafe { core::str::from_utf8_unchecked(bytes) })
    }
}
