//! Fatal invariant violations
//!
//! A broken scheduler queue or refcount means kernel memory can no longer be
//! trusted. [`kernel_bug!`](crate::kernel_bug) dumps what it knows through the
//! log facade and panics the simulated core.

/// Log a fatal diagnostic and halt.
#[macro_export]
macro_rules! kernel_bug {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        log::error!("KERNEL BUG at {}:{}: {}", file!(), line!(), msg);
        $crate::panic::halt(&msg)
    }};
}

/// `kernel_bug!` unless the condition holds.
#[macro_export]
macro_rules! bug_on {
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::kernel_bug!($($arg)+);
        }
    };
}

/// Stop the offending core.
#[cold]
#[inline(never)]
pub fn halt(msg: &str) -> ! {
    panic!("kernel bug: {msg}")
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "kernel bug: refcount underflow")]
    fn test_kernel_bug_panics() {
        crate::kernel_bug!("refcount {}", "underflow");
    }

    #[test]
    fn test_bug_on_false_is_silent() {
        crate::bug_on!(1 + 1 == 3, "arithmetic broke");
    }
}
