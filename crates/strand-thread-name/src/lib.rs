//! Debug-friendly OS thread naming.
//!
//! Thread names are advisory: they exist so that worker threads are easy to
//! identify in debuggers, profilers and crash dumps. They are not used for
//! any scheduling decision.
//!
//! Platform notes:
//!
//! - POSIX limits names to 15 bytes (plus the terminating NUL). Longer names
//!   are rejected with [`ThreadNameError::TooLong`] rather than silently
//!   truncated.
//! - On macOS only the current thread can be renamed; naming another thread
//!   through its handle reports [`ThreadNameError::Unsupported`].

#![warn(missing_docs)]

use std::thread::JoinHandle;

use thiserror::Error;

/// Maximum name length in bytes, excluding the terminating NUL.
pub const MAX_THREAD_NAME_LEN: usize = 15;

/// Failure modes of the naming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadNameError {
    /// The name exceeds [`MAX_THREAD_NAME_LEN`] bytes.
    #[error("thread name exceeds {MAX_THREAD_NAME_LEN} bytes")]
    TooLong,
    /// The name contains an interior NUL byte.
    #[error("thread name contains an interior NUL byte")]
    InteriorNul,
    /// The platform cannot rename this thread.
    #[error("thread renaming is not supported for this thread on this platform")]
    Unsupported,
    /// The underlying OS call failed with the given code.
    #[error("os error {0}")]
    Os(i32),
}

/// Name the calling thread.
pub fn set_current_thread_name(name: &str) -> Result<(), ThreadNameError> {
    imp::set_current(name)
}

/// Read the calling thread's OS-level name.
///
/// Returns an empty string when the platform cannot report one.
#[must_use]
pub fn current_thread_name() -> String {
    imp::get_current()
}

/// Name the thread behind `handle`.
pub fn set_thread_name<T>(handle: &JoinHandle<T>, name: &str) -> Result<(), ThreadNameError> {
    imp::set_for_handle(handle, name)
}

/// Read the OS-level name of the thread behind `handle`.
///
/// Returns an empty string when the platform cannot report one.
#[must_use]
pub fn thread_name<T>(handle: &JoinHandle<T>) -> String {
    imp::get_for_handle(handle)
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::os::unix::thread::JoinHandleExt;
    use std::thread::JoinHandle;

    use super::{ThreadNameError, MAX_THREAD_NAME_LEN};

    fn checked_name(name: &str) -> Result<CString, ThreadNameError> {
        if name.len() > MAX_THREAD_NAME_LEN {
            return Err(ThreadNameError::TooLong);
        }
        CString::new(name).map_err(|_| ThreadNameError::InteriorNul)
    }

    pub fn set_current(name: &str) -> Result<(), ThreadNameError> {
        let name = checked_name(name)?;
        set_raw(unsafe { libc::pthread_self() }, &name, true)
    }

    pub fn set_for_handle<T>(
        handle: &JoinHandle<T>,
        name: &str,
    ) -> Result<(), ThreadNameError> {
        let name = checked_name(name)?;
        let thread = handle.as_pthread_t() as libc::pthread_t;
        let is_current = unsafe { libc::pthread_equal(thread, libc::pthread_self()) } != 0;
        set_raw(thread, &name, is_current)
    }

    pub fn get_current() -> String {
        get_raw(unsafe { libc::pthread_self() })
    }

    pub fn get_for_handle<T>(handle: &JoinHandle<T>) -> String {
        get_raw(handle.as_pthread_t() as libc::pthread_t)
    }

    #[cfg(target_os = "macos")]
    fn set_raw(
        _thread: libc::pthread_t,
        name: &std::ffi::CStr,
        is_current: bool,
    ) -> Result<(), ThreadNameError> {
        // macOS can only rename the calling thread.
        if !is_current {
            return Err(ThreadNameError::Unsupported);
        }
        match unsafe { libc::pthread_setname_np(name.as_ptr()) } {
            0 => Ok(()),
            code => Err(ThreadNameError::Os(code)),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn set_raw(
        thread: libc::pthread_t,
        name: &std::ffi::CStr,
        _is_current: bool,
    ) -> Result<(), ThreadNameError> {
        match unsafe { libc::pthread_setname_np(thread, name.as_ptr()) } {
            0 => Ok(()),
            code => Err(ThreadNameError::Os(code)),
        }
    }

    fn get_raw(thread: libc::pthread_t) -> String {
        let mut buf = [0 as libc::c_char; MAX_THREAD_NAME_LEN + 1];
        let rc = unsafe { libc::pthread_getname_np(thread, buf.as_mut_ptr(), buf.len()) };
        if rc != 0 {
            return String::new();
        }
        let bytes: Vec<u8> = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(not(unix))]
mod imp {
    use std::thread::JoinHandle;

    use super::ThreadNameError;

    pub fn set_current(_name: &str) -> Result<(), ThreadNameError> {
        Err(ThreadNameError::Unsupported)
    }

    pub fn set_for_handle<T>(
        _handle: &JoinHandle<T>,
        _name: &str,
    ) -> Result<(), ThreadNameError> {
        Err(ThreadNameError::Unsupported)
    }

    pub fn get_current() -> String {
        String::new()
    }

    pub fn get_for_handle<T>(_handle: &JoinHandle<T>) -> String {
        String::new()
    }
}
