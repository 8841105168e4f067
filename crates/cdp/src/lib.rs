//! Chrome DevTools Protocol plumbing.
//!
//! - `client`: command/response and event dispatch over one WebSocket
//! - `browser`: locating, launching and attaching to a Chromium process

pub mod browser;
pub mod client;

pub use browser::{find_browser_binary, Browser};
pub use client::{CdpClient, EventStream};
