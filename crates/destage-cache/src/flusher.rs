//! Background flush worker.
//!
//! One thread per cached device, woken through an event channel. Senders
//! never block; the idle timer is the channel's receive timeout, armed when
//! the cache transitions from all-clean to having at least one dirty block.
//!
//! Errors inside worker flush passes have no synchronous caller — they are
//! recorded in the I/O error log by the pass itself and otherwise ignored
//! here.

use crate::cache::Shared;
use destage_error::Result;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Wake-up reasons for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushEvent {
    /// The idle period may have changed; reload it.
    ConfigChanged,
    /// The cache went from all-clean to at least one dirty block.
    StartIdleTimer,
    /// Explicit flush request (threshold crossing, sync call).
    ForceFlush,
    /// Tear the worker down.
    Shutdown,
}

pub(crate) fn spawn(shared: Arc<Shared>, events: Receiver<FlushEvent>) -> Result<JoinHandle<()>> {
    let name = format!("destage-flush-{}", shared.device_id());
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || run(&shared, &events))?;
    Ok(handle)
}

fn run(shared: &Arc<Shared>, events: &Receiver<FlushEvent>) {
    let mut armed: Option<Duration> = None;
    loop {
        let event = match armed {
            Some(period) => match events.recv_timeout(period) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match events.recv() {
                Ok(event) => Some(event),
                Err(_) => break,
            },
        };

        match event {
            None => {
                // Idle timeout expired with dirty blocks outstanding.
                tracing::debug!(
                    target: "destage::flush",
                    device = %shared.device_id(),
                    "idle_flush_pass"
                );
                let _ = shared.flush_pass();
                armed = None;
            }
            Some(FlushEvent::StartIdleTimer) => {
                armed = shared.idle_period();
            }
            Some(FlushEvent::ConfigChanged) => {
                // Re-arm with the new period only while dirty blocks remain.
                armed = if shared.dirty_count() > 0 {
                    shared.idle_period()
                } else {
                    None
                };
            }
            Some(FlushEvent::ForceFlush) => {
                tracing::debug!(
                    target: "destage::flush",
                    device = %shared.device_id(),
                    "forced_flush_pass"
                );
                let _ = shared.flush_pass();
                armed = if shared.dirty_count() > 0 {
                    shared.idle_period()
                } else {
                    None
                };
            }
            Some(FlushEvent::Shutdown) => break,
        }
    }
    tracing::debug!(
        target: "destage::flush",
        device = %shared.device_id(),
        "flush_worker_exit"
    );
}
