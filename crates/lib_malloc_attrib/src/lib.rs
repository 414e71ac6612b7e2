//! Companion crate to [`malloc_attrib`].  This crate compiles into `libmalloc_attrib.so`, which
//! owns one process-wide attribution session and exposes it to native hosts through a C ABI.
//!
//! Every function returns 0 on success and the negative code of the failure otherwise (see
//! `malloc_attrib::Error::code`).  Log output goes to stderr, filtered by the
//! `MALLOC_ATTRIB_LOG` environment variable (default `info`).

use std::{ffi::CStr, panic, path::Path};

use libc::{c_char, c_int};
use malloc_attrib::{GotBackend, Result, Session};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/// Returned when the engine panicked inside a control call.
pub const MALLOC_ATTRIB_PANIC: c_int = -100;

static SESSION: Lazy<Session<GotBackend>> = Lazy::new(|| {
    let filter =
        EnvFilter::try_from_env("MALLOC_ATTRIB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    // The host may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Session::new(GotBackend::new())
});

fn status<F: FnOnce() -> Result<()>>(f: F) -> c_int {
    match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::warn!("{}", e);
            e.code()
        }
        Err(_) => MALLOC_ATTRIB_PANIC,
    }
}

// Null and non-UTF-8 strings read as absent.
unsafe fn optional_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!("ignoring non-UTF-8 argument: {}", e);
            None
        }
    }
}

/// Start attributing allocations.
///
/// `configs` is the packed configuration word, `space` the storage directory and `regex` the
/// library filter; either may be null.
///
/// # Safety
///
/// `space` and `regex` must be null or point to NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn malloc_attrib_start(
    configs: u32,
    space: *const c_char,
    regex: *const c_char,
) -> c_int {
    let space = optional_str(space).map(Path::new);
    let regex = optional_str(regex);
    status(|| SESSION.start(configs, space, regex))
}

/// Restore hooked libraries, log a final report and release all engine memory.
#[no_mangle]
pub extern "C" fn malloc_attrib_stop() -> c_int {
    status(|| SESSION.stop())
}

/// Log the current report and write it to the storage directory.
#[no_mangle]
pub extern "C" fn malloc_attrib_print() -> c_int {
    status(|| SESSION.print())
}
