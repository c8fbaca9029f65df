//! Lingering close (component J, other half).
//!
//! When a connection is about to be torn down but the client may still be
//! sending bytes (a body we chose not to read, a pipelined request behind
//! a non-2xx response), closing the socket immediately risks the kernel
//! sending an RST that clobbers the response we just wrote before the
//! client's stack delivers it to the application. `§4.12` drains and
//! discards whatever arrives for up to `lingering_time`, reading in
//! `lingering_timeout`-bounded slices, then closes regardless.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};

use crate::config::types::ListenerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Off,
    /// Only linger when the caller believes the client has unsent bytes
    /// (request was rejected before its body was fully read/discarded).
    On,
    Always,
}

pub fn policy(listener: &ListenerConfig) -> Policy {
    match listener.lingering_close.as_str() {
        "off" => Policy::Off,
        "always" => Policy::Always,
        _ => Policy::On,
    }
}

pub fn should_linger(policy: Policy, unread_body_remains: bool) -> bool {
    match policy {
        Policy::Off => false,
        Policy::Always => true,
        Policy::On => unread_body_remains,
    }
}

/// Drain and discard input until the client closes, `lingering_time`
/// elapses, or a single read exceeds `lingering_timeout`. Write errors
/// are not possible here — only reads happen — so any I/O error just
/// ends the drain early, same as a clean EOF.
pub async fn drain<S>(stream: &mut S, listener: &ListenerConfig)
where
    S: AsyncRead + Unpin,
{
    let total_budget = Duration::from_secs(listener.lingering_time_secs);
    let per_read = Duration::from_secs(listener.lingering_timeout_secs);
    let deadline = Instant::now() + total_budget;
    let mut scratch = [0u8; 4096];

    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        let read_budget = remaining.min(per_read);
        match timeout(read_budget, stream.read(&mut scratch)).await {
            Ok(Ok(0)) => break,  // clean EOF
            Ok(Ok(_)) => continue, // discard and keep draining
            Ok(Err(_)) | Err(_) => break, // I/O error or per-read timeout
        }
    }
}
