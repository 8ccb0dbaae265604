//! Crate-level tests driving the service against a scripted backend.
//!
//! The backend is a `sh` script, so these run on unix only.

#[cfg(unix)]
mod support;
#[cfg(unix)]
mod unit;
