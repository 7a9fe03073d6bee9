//! Host virtual-memory primitives.
//!
//! This module picks the backend for the host platform. Every backend exposes the same
//! set of free functions: `page_size`, `reserve`, `release`, `commit`, `decommit`,
//! `protect` and `current_thread_id`.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

#[cfg(not(any(unix, windows)))]
compile_error!("gmm supports only unix and windows hosts");
