//! bmeter: a bandwidth meter for frame broadcast workloads.
//!
//! Two roles share this crate:
//! - The server broadcasts fixed-size synthetic frames to every connected
//!   client on a timer (frame duration, frame size, burst width)
//! - The client opens a configurable number of connections and discards
//!   whatever arrives
//!
//! Both roles run a single mio event loop (epoll on Linux, kqueue on macOS).

pub mod client;
pub mod config;
pub mod frame;
pub mod runtime;
pub mod server;
