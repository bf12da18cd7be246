//! Sniffer producer thread (spec 4.3, 5).
//!
//! Loop: reserve a write slot, attempt a read; on success commit with
//! `gap=false` and the device timestamp; on failure commit a gap, sleep
//! one second, reset, and retry. The ok↔gap transition is logged exactly
//! once per transition, not on every iteration, so a prolonged hardware
//! outage produces one log line rather than ten thousand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::Sniffer;
use crate::ring_buffer::RingBuffer;

/// Shared flag the caller can set to ask the producer loop to exit after
/// its current iteration.
#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag(AtomicBool::new(false))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Attempt to raise this thread to `SCHED_FIFO` priority 1 so the kernel
/// cannot starve it under load. Failure (e.g. missing `CAP_SYS_NICE`) is
/// logged and non-fatal: the archiver still runs, just without the
/// real-time guarantee.
pub fn try_set_realtime_priority() {
    // SAFETY: libc::sched_setscheduler with a pid of 0 affects the
    // calling thread; the param struct is fully initialized before use.
    unsafe {
        let param = libc::sched_param { sched_priority: 1 };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "failed to set sniffer thread to SCHED_FIFO priority 1, continuing at normal priority"
            );
        } else {
            info!("sniffer thread running at SCHED_FIFO priority 1");
        }
    }
}

/// Run the producer loop against `sniffer`, writing blocks into `ring`,
/// until `shutdown` is signalled. Intended to be spawned on its own
/// thread by the caller, which also decides whether to call
/// [`try_set_realtime_priority`] first.
pub fn run(mut sniffer: Box<dyn Sniffer>, ring: Arc<RingBuffer>, shutdown: Arc<ShutdownFlag>) {
    let mut currently_gapped = false;
    let mut scratch = ring.new_scratch_block();

    while !shutdown.is_set() {
        match sniffer.read(&mut scratch) {
            Ok(timestamp) => {
                if currently_gapped {
                    info!("sniffer recovered, resuming data capture");
                    currently_gapped = false;
                }
                let slot = ring.reserve_write();
                let overflow = ring.commit_write(slot, false, timestamp, |block| {
                    block.entries.copy_from_slice(&scratch.entries);
                    block.timestamp = timestamp;
                    block.gap = false;
                });
                if overflow {
                    warn!("ring buffer overflow: a non-strict reader fell behind and was skipped");
                }
            }
            Err(err) => {
                if !currently_gapped {
                    warn!(%err, "sniffer read failed, entering gap state");
                    currently_gapped = true;
                }
                let slot = ring.reserve_write();
                ring.commit_write(slot, true, 0, |block| block.gap = true);

                std::thread::sleep(Duration::from_secs(1));
                if let Err(err) = sniffer.reset() {
                    warn!(%err, "sniffer reset failed");
                }
            }
        }
    }
}
