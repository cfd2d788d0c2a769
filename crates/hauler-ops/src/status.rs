//! Shared operation status: counters, speed meters, the speed-limit
//! governor and the adaptive progress buffer limit, all behind one mutex.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hauler_core::ASYNC_COPY_BUF_SIZE;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::meter::{
    ProgressSpeedMeter, TransferSpeedMeter, ASYNC_SLOW_COPY_BUF_MINBLOCKS,
    ASYNC_SLOW_COPY_BUF_SIZE,
};

/// Limits at or above this are "unbounded class": no per-chunk sleep, only braking.
pub const HIGH_SPEED_LIMIT: u64 = 1024 * 1024;
/// Unbounded-class limits are re-evaluated every `limit / HIGH_SPEED_LIMIT_BRAKE_DIV` bytes.
pub const HIGH_SPEED_LIMIT_BRAKE_DIV: u64 = 10;
/// Longest single braking sleep.
const MAX_BRAKE_MS: u64 = 1000;
/// Governor parameters are recomputed at least this often.
const SETUP_INTERVAL_MS: u64 = 1000;
/// Minimum interval between adaptive buffer-limit tests.
const BUFFER_LIMIT_TEST_INTERVAL_MS: u64 = 1000;

/// Point-in-time copy of the status block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Real file bytes written so far.
    pub transferred_bytes: u64,
    /// Bytes per second.
    pub transfer_speed: u64,
    /// Progress units completed so far.
    pub progress_size: u64,
    /// Progress units per second.
    pub progress_speed: u64,
    /// Configured speed limit.
    pub speed_limit: Option<u64>,
}

impl StatusSnapshot {
    /// Estimated time left for `total` progress units.
    pub fn time_left(&self, total: u64) -> Option<Duration> {
        if self.progress_speed == 0 {
            return None;
        }
        let remaining = total.saturating_sub(self.progress_size);
        Some(Duration::from_secs(remaining.div_ceil(self.progress_speed)))
    }
}

#[derive(Debug, Default)]
struct Governor {
    limit: Option<u64>,
    /// Sleep owed after a chunk of `last_buffer` bytes; None until the first chunk.
    sleep_after_write: Option<u64>,
    last_buffer: usize,
    last_setup: u64,
    bytes_since_setup: u64,
    slept_since_setup: u64,
}

impl Governor {
    fn reset(&mut self, now: u64) {
        self.sleep_after_write = None;
        self.last_setup = now;
        self.bytes_since_setup = 0;
        self.slept_since_setup = 0;
    }

    /// Sleep in ms owed for a chunk of `count` bytes out of a `buffer`-sized request.
    fn on_chunk(&mut self, count: u64, buffer: usize, now: u64) -> u64 {
        let Some(limit) = self.limit else {
            return 0;
        };
        let buffer = buffer.max(1);

        let Some(sleep_after_write) = self.sleep_after_write else {
            let per_chunk = if limit >= HIGH_SPEED_LIMIT {
                0
            } else {
                buffer as u64 * 1000 / limit
            };
            self.sleep_after_write = Some(per_chunk);
            self.last_buffer = buffer;
            self.bytes_since_setup = count;
            let sleep = if limit >= HIGH_SPEED_LIMIT {
                0
            } else {
                count * 1000 / limit
            };
            self.slept_since_setup = sleep;
            return sleep;
        };

        self.bytes_since_setup += count;
        let elapsed = now.saturating_sub(self.last_setup);
        let threshold = if limit >= HIGH_SPEED_LIMIT {
            (limit / HIGH_SPEED_LIMIT_BRAKE_DIV).max(1)
        } else {
            limit
        };

        if elapsed >= SETUP_INTERVAL_MS || self.bytes_since_setup >= threshold {
            let ideal = self.bytes_since_setup * 1000 / limit;
            let brake = ideal.saturating_sub(elapsed).min(MAX_BRAKE_MS);

            // Time the producer needs per buffer on its own, without our sleeps.
            let natural = elapsed.saturating_sub(self.slept_since_setup);
            let natural_per_buffer = natural * buffer as u64 / self.bytes_since_setup.max(1);
            let required_per_buffer = buffer as u64 * 1000 / limit;
            self.sleep_after_write = Some(required_per_buffer.saturating_sub(natural_per_buffer));
            self.last_buffer = buffer;

            self.last_setup = now + brake;
            self.bytes_since_setup = 0;
            self.slept_since_setup = 0;
            return brake;
        }

        let sleep = sleep_after_write * count / self.last_buffer.max(1) as u64;
        self.slept_since_setup += sleep;
        sleep
    }
}

#[derive(Debug)]
struct BufferLimit {
    enabled: bool,
    current: usize,
    last_test: Option<u64>,
    file_blocks: u64,
    file_bytes: u64,
    file_start: u64,
}

impl Default for BufferLimit {
    fn default() -> Self {
        Self {
            enabled: false,
            current: ASYNC_SLOW_COPY_BUF_SIZE,
            last_test: None,
            file_blocks: 0,
            file_bytes: 0,
            file_start: 0,
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    transfer: TransferSpeedMeter,
    progress: ProgressSpeedMeter,
    transferred: u64,
    progress_size: u64,
    governor: Governor,
    buffer_limit: BufferLimit,
}

impl StatusInner {
    fn chunk_size(&self, buffer: usize) -> usize {
        let mut size = buffer;
        if let Some(limit) = self.governor.limit {
            size = size.min(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        if self.buffer_limit.enabled {
            size = size.min(self.buffer_limit.current);
        }
        size.max(1)
    }
}

/// The status block of one running script.
///
/// Shared between the script task (writer) and the UI (reader).
#[derive(Debug)]
pub struct OperationStatus {
    inner: Mutex<StatusInner>,
    clock: Arc<dyn Clock>,
}

impl OperationStatus {
    /// Create a status block with an optional speed limit.
    pub fn new(clock: Arc<dyn Clock>, speed_limit: Option<u64>) -> Self {
        let now = clock.now_ms();
        let mut governor = Governor {
            limit: speed_limit.map(|l| l.max(1)),
            ..Default::default()
        };
        governor.reset(now);
        let mut transfer = TransferSpeedMeter::transfer();
        let mut progress = ProgressSpeedMeter::progress();
        transfer.clear(now);
        progress.clear(now);
        Self {
            inner: Mutex::new(StatusInner {
                transfer,
                progress,
                transferred: 0,
                progress_size: 0,
                governor,
                buffer_limit: BufferLimit::default(),
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current tick of the status clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Start (or restart) both meters; `in_progress` keeps the counters.
    pub fn init_speed_meters(&self, in_progress: bool) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.transfer.just_connected(now);
        inner.progress.just_connected(now);
        inner.governor.reset(now);
        if !in_progress {
            inner.transferred = 0;
            inner.progress_size = 0;
        }
    }

    /// Credit `count` completed bytes.
    ///
    /// `progress_only` bytes move the progress meter but are not file data.
    /// `buffer_size` is the size of the request that produced them. When
    /// `limit_buffer_size` is given it receives the size of the next request.
    /// Returns how long the caller must sleep before issuing it; the sleep
    /// happens after the lock is released.
    pub fn add_bytes(
        &self,
        count: u64,
        progress_only: bool,
        buffer_size: usize,
        limit_buffer_size: Option<&mut usize>,
        max_packet_size: usize,
    ) -> Duration {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let mut sleep_ms = 0;
        if progress_only {
            inner.progress.bytes_received(count, now, 0);
            inner.progress_size += count;
        } else {
            let credited = match inner.governor.limit {
                Some(limit) => count.min(limit),
                None => count,
            };
            inner.transfer.bytes_received(credited, now, max_packet_size);
            inner.progress.bytes_received(credited, now, max_packet_size);
            inner.transferred += count;
            inner.progress_size += count;
            sleep_ms = inner.governor.on_chunk(count, buffer_size, now);

            if inner.buffer_limit.enabled && count > 0 {
                let bl = &mut inner.buffer_limit;
                bl.file_blocks = bl.file_blocks.saturating_add(1);
                bl.file_bytes += count;
                let enough = bl.file_blocks >= ASYNC_SLOW_COPY_BUF_MINBLOCKS as u64
                    || bl.file_bytes
                        >= (ASYNC_SLOW_COPY_BUF_MINBLOCKS * ASYNC_SLOW_COPY_BUF_SIZE) as u64;
                let due = bl
                    .last_test
                    .is_none_or(|t| now.saturating_sub(t) >= BUFFER_LIMIT_TEST_INTERVAL_MS);
                if enough && due {
                    let (current, blocks, start) = (bl.current, bl.file_blocks, bl.file_start);
                    let next = inner
                        .transfer
                        .adjust_progress_buffer_limit(current, blocks, start, now);
                    if next != current {
                        tracing::debug!(from = current, to = next, "progress buffer limit changed");
                    }
                    inner.buffer_limit.current = next;
                    inner.buffer_limit.last_test = Some(now);
                }
            }
        }

        if let Some(limit) = limit_buffer_size {
            *limit = inner.chunk_size(buffer_size);
        }
        Duration::from_millis(sleep_ms)
    }

    /// Request size for a buffer of `buffer_size` under the current limits.
    pub fn chunk_size(&self, buffer_size: usize) -> usize {
        self.lock().chunk_size(buffer_size)
    }

    /// Snapshot of counters and speeds.
    pub fn get_status(&self) -> StatusSnapshot {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        StatusSnapshot {
            transferred_bytes: inner.transferred,
            transfer_speed: inner.transfer.get_speed(now),
            progress_size: inner.progress_size,
            progress_speed: inner.progress.get_speed(now),
            speed_limit: inner.governor.limit,
        }
    }

    /// Change the speed limit; zero is treated as one byte per second.
    pub fn set_speed_limit(&self, limit: Option<u64>) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.governor.limit = limit.map(|l| l.max(1));
        inner.governor.reset(now);
    }

    pub fn speed_limit(&self) -> Option<u64> {
        self.lock().governor.limit
    }

    /// Turn the adaptive buffer limit on or off.
    pub fn enable_progress_buffer_limit(&self, enabled: bool) {
        let mut inner = self.lock();
        inner.buffer_limit.enabled = enabled;
        if !enabled {
            inner.buffer_limit.current = ASYNC_SLOW_COPY_BUF_SIZE;
            inner.buffer_limit.last_test = None;
        }
    }

    /// Current adaptive buffer limit, if enabled.
    pub fn progress_buffer_limit(&self) -> Option<usize> {
        let inner = self.lock();
        inner.buffer_limit.enabled.then_some(inner.buffer_limit.current)
    }

    /// Mark the start of a new file for the adaptive buffer limit.
    pub fn set_file_start_params(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.buffer_limit.file_blocks = 0;
        inner.buffer_limit.file_bytes = 0;
        inner.buffer_limit.file_start = now;
    }

    /// (transferred bytes, progress units).
    pub fn transferred_and_progress(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.transferred, inner.progress_size)
    }

    /// Reset both counters, e.g. when a file restarts from offset zero.
    pub fn rollback_to(&self, transferred: u64, progress: u64) {
        let mut inner = self.lock();
        inner.transferred = transferred;
        inner.progress_size = progress;
    }

    /// Set the progress counter without feeding the meters.
    pub fn set_progress(&self, progress: u64) {
        self.lock().progress_size = progress;
    }

    /// Transferred bytes; reconnects the transfer meter if it collapsed.
    pub fn reset_transfer_speed_if_needed(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if inner.transfer.reset_needed() {
            inner.transfer.just_connected(now);
        }
        inner.transferred
    }

    /// Largest buffer the adaptive limit may pick.
    pub fn max_buffer_limit() -> usize {
        ASYNC_COPY_BUF_SIZE
    }
}
