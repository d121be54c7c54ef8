//! Allocation-free diagnostics on stderr.
//!
//! Messages are formatted into a stack buffer and written straight to fd 2,
//! so reporting works from inside allocation hooks and while the heap is
//! corrupt.

use crate::crash_key::FixedString;
use core::fmt::{self, Write};

const LINE_CAPACITY: usize = 512;

/// Format `args` and write them to stderr.
pub fn write_stderr(args: fmt::Arguments<'_>) {
    let mut line = FixedString::<LINE_CAPACITY>::new();
    let _ = line.write_fmt(args);
    write_all(line.as_bytes());
}

fn write_all(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Write the message and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    write_stderr(args);
    unsafe { libc::abort() }
}

/// `eprintln!` without the allocation.
#[macro_export]
macro_rules! report {
    ($($arg:tt)*) => {
        $crate::diag::write_stderr(format_args!($($arg)*))
    };
}

/// Report and abort.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::diag::fatal(format_args!($($arg)*))
    };
}
