//! Resilient control-plane bridge for network streaming devices.
//!
//! The hosting process speaks line-delimited JSON-RPC over this crate's
//! [`server`] and gets a session that survives device sleep, address changes
//! and flaky Wi-Fi: connection loss triggers a backoff-driven reconnection
//! loop, system wakes take a zero-delay fast path, and every state change is
//! pushed back as a notification.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod backoff;
pub mod classify;
pub mod config;
pub mod device;
pub mod events;
pub mod listener;
pub mod sanitizer;
pub mod server;
pub mod session;
pub mod signal;
pub mod sim;
pub mod storage;
pub mod wake;
