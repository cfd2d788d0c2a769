//! Sliding-window throughput measurement.
//!
//! A meter keeps two views of recent traffic:
//!
//! - a ring of fixed-duration time steps, each accumulating the bytes that
//!   arrived during it, used to compute a smoothed rate while data flows fast;
//! - a ring of the most recent "packets" (byte count plus completion time),
//!   used when packets are so sparse that a handful of them span more than
//!   the minimum interval, and to detect a sudden collapse of throughput.
//!
//! Two variants share the algorithm: [`TransferSpeedMeter`] measures real
//! file bytes, [`ProgressSpeedMeter`] measures progress units for the
//! time-left estimate.

use hauler_core::ASYNC_COPY_BUF_SIZE;

use crate::ring::Ring;

/// Smallest block the adaptive limit selects.
pub const ASYNC_SLOW_COPY_BUF_SIZE: usize = 8 * 1024;
/// Number of recent blocks the adaptive limit looks at.
pub const ASYNC_SLOW_COPY_BUF_MINBLOCKS: usize = 12;
/// Blocks older than this are ignored by the adaptive limit.
const BUFFER_LIMIT_MAX_AGE_MS: u64 = 2000;
/// Blocks per second each limit size is expected to sustain.
const BUFFER_LIMIT_BLOCKS_PER_SEC: u64 = 10;

/// Candidate block sizes for the adaptive limit, ascending.
///
/// 40 KiB to 184 KiB are left out so that a link slightly faster than what
/// 32 KiB blocks sustain jumps straight to 192 KiB.
const BUFFER_LIMIT_LADDER: [usize; 18] = [
    8 * 1024,
    16 * 1024,
    24 * 1024,
    32 * 1024,
    192 * 1024,
    256 * 1024,
    320 * 1024,
    384 * 1024,
    448 * 1024,
    512 * 1024,
    576 * 1024,
    640 * 1024,
    704 * 1024,
    768 * 1024,
    832 * 1024,
    896 * 1024,
    960 * 1024,
    1024 * 1024,
];

/// Tuning of one meter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterParams {
    /// Duration of one time step.
    pub step_ms: u64,
    /// Number of closed time steps averaged.
    pub steps: usize,
    /// Number of packets remembered.
    pub packets: usize,
    /// Packet span above which the low-rate formula is used.
    pub min_interval_ms: u64,
    /// No packet for this long means the speed is zero.
    pub stale_ms: u64,
    /// A packet this many times slower than its predecessor collapses the speed.
    pub slowdown_factor: u64,
    /// A collapse asks the owner to reset the meter.
    pub flags_reset: bool,
}

/// Transfer meter step length.
pub const TRSPMETER_ACTSPEEDSTEP: u64 = 200;
/// Transfer meter step count.
pub const TRSPMETER_ACTSPEEDNUMOFSTEPS: usize = 25;
/// Transfer meter packet memory.
pub const TRSPMETER_NUMOFSTOREDPACKETS: usize = 40;
/// Transfer meter low-rate threshold.
pub const TRSPMETER_STPCKTSMININTERVAL: u64 = 2000;

/// Progress meter step length.
pub const PRSPMETER_ACTSPEEDSTEP: u64 = 500;
/// Progress meter step count.
pub const PRSPMETER_ACTSPEEDNUMOFSTEPS: usize = 60;
/// Progress meter packet memory.
pub const PRSPMETER_NUMOFSTOREDPACKETS: usize = 100;
/// Progress meter low-rate threshold.
pub const PRSPMETER_STPCKTSMININTERVAL: u64 = 10000;

impl MeterParams {
    /// Real file bytes.
    pub const TRANSFER: Self = Self {
        step_ms: TRSPMETER_ACTSPEEDSTEP,
        steps: TRSPMETER_ACTSPEEDNUMOFSTEPS,
        packets: TRSPMETER_NUMOFSTOREDPACKETS,
        min_interval_ms: TRSPMETER_STPCKTSMININTERVAL,
        stale_ms: 2000,
        slowdown_factor: 2,
        flags_reset: true,
    };

    /// Progress units.
    pub const PROGRESS: Self = Self {
        step_ms: PRSPMETER_ACTSPEEDSTEP,
        steps: PRSPMETER_ACTSPEEDNUMOFSTEPS,
        packets: PRSPMETER_NUMOFSTOREDPACKETS,
        min_interval_ms: PRSPMETER_STPCKTSMININTERVAL,
        stale_ms: 5000,
        slowdown_factor: 4,
        flags_reset: false,
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Packet {
    size: u64,
    time: u64,
}

/// Throughput meter with `S` step slots and `P` packet slots.
///
/// Both rings hold one slot more than the averaged count: the newest step
/// is the open one still accumulating, the oldest packet anchors the
/// interval of the others.
#[derive(Debug, Clone)]
pub struct SpeedMeter<const S: usize, const P: usize> {
    params: MeterParams,
    steps: Ring<u64, S>,
    /// Tick at which the open step closes.
    step_limit: u64,
    packets: Ring<Packet, P>,
    last_transfer: u64,
    max_packet_size: usize,
    reset_needed: bool,
}

/// Meter for file bytes.
pub type TransferSpeedMeter =
    SpeedMeter<{ TRSPMETER_ACTSPEEDNUMOFSTEPS + 1 }, { TRSPMETER_NUMOFSTOREDPACKETS + 1 }>;

/// Meter for progress units.
pub type ProgressSpeedMeter =
    SpeedMeter<{ PRSPMETER_ACTSPEEDNUMOFSTEPS + 1 }, { PRSPMETER_NUMOFSTOREDPACKETS + 1 }>;

impl TransferSpeedMeter {
    pub fn transfer() -> Self {
        Self::with_params(MeterParams::TRANSFER)
    }
}

impl ProgressSpeedMeter {
    pub fn progress() -> Self {
        Self::with_params(MeterParams::PROGRESS)
    }
}

impl<const S: usize, const P: usize> SpeedMeter<S, P> {
    /// Create an idle meter.
    pub fn with_params(params: MeterParams) -> Self {
        debug_assert!(params.step_ms > 0);
        debug_assert_eq!(params.steps + 1, S);
        debug_assert_eq!(params.packets + 1, P);
        Self {
            params,
            steps: Ring::new(),
            step_limit: 0,
            packets: Ring::new(),
            last_transfer: 0,
            max_packet_size: 0,
            reset_needed: false,
        }
    }

    pub fn params(&self) -> &MeterParams {
        &self.params
    }

    /// Forget everything; the meter reports zero until [`Self::just_connected`].
    pub fn clear(&mut self, now: u64) {
        self.steps.clear();
        self.packets.clear();
        self.step_limit = 0;
        self.last_transfer = now;
        self.reset_needed = false;
    }

    /// Start measuring at `now`.
    pub fn just_connected(&mut self, now: u64) {
        self.steps.clear();
        self.steps.push(0);
        self.step_limit = now + self.params.step_ms;
        self.packets.clear();
        self.last_transfer = now;
        self.reset_needed = false;
    }

    /// Whether the meter has been connected.
    pub fn is_connected(&self) -> bool {
        !self.steps.is_empty()
    }

    /// A collapse was reported and the owner should reconnect the meter.
    pub fn reset_needed(&self) -> bool {
        self.reset_needed
    }

    /// Largest packet the caller announced it may report next.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Record `count` bytes completed at `time`.
    pub fn bytes_received(&mut self, count: u64, time: u64, max_packet_size: usize) {
        if !self.is_connected() {
            self.just_connected(time);
        }
        if max_packet_size > 0 {
            self.max_packet_size = max_packet_size;
        }
        if count > 0 {
            self.last_transfer = time;
            self.packets.push(Packet { size: count, time });
        }

        if time < self.step_limit {
            if let Some(open) = self.steps.newest_mut() {
                *open += count;
            }
            return;
        }

        let step = self.params.step_ms;
        let empty = (time - self.step_limit) / step;
        // More empty steps than the ring holds wipe it entirely.
        for _ in 0..empty.min(self.params.steps as u64) {
            self.steps.push(0);
        }
        self.step_limit += (empty + 1) * step;
        self.steps.push(count);
    }

    /// Current speed in units per second.
    pub fn get_speed(&mut self, now: u64) -> u64 {
        if self.packets.len() < 2 {
            return 0;
        }
        let stale = now.saturating_sub(self.last_transfer) > self.params.stale_ms;

        let used = self.packets.len().min(self.params.packets + 1);
        let (Some(newest), Some(oldest)) =
            (self.packets.newest().copied(), self.packets.get_newest(used - 1).copied())
        else {
            return 0;
        };

        if newest.time.saturating_sub(oldest.time) > self.params.min_interval_ms {
            if stale {
                return 0;
            }
            if self.collapsed() {
                if self.params.flags_reset {
                    self.reset_needed = true;
                }
                return 0;
            }
            let bytes: u64 = self
                .packets
                .iter_newest()
                .take(used - 1)
                .map(|p| p.size)
                .sum();
            let elapsed = now.saturating_sub(oldest.time);
            return if elapsed > 0 { bytes * 1000 / elapsed } else { 0 };
        }

        if stale {
            return 0;
        }
        self.step_speed(now)
    }

    /// The newest packet arrived at least `slowdown_factor` times slower
    /// than its predecessor.
    fn collapsed(&self) -> bool {
        let (Some(a), Some(b), Some(c)) = (
            self.packets.get_newest(0),
            self.packets.get_newest(1),
            self.packets.get_newest(2),
        ) else {
            return false;
        };
        let newest_gap = a.time.saturating_sub(b.time);
        let previous_gap = b.time.saturating_sub(c.time);
        if newest_gap == 0 || previous_gap == 0 {
            return false;
        }
        let newest_rate = a.size * 1000 / newest_gap;
        let previous_rate = b.size * 1000 / previous_gap;
        newest_rate.saturating_mul(self.params.slowdown_factor) <= previous_rate
    }

    /// Average over up to `steps` closed steps plus the elapsed part of the
    /// current one.
    fn step_speed(&self, now: u64) -> u64 {
        let count = self.steps.len();
        if count == 0 {
            return 0;
        }
        let step = self.params.step_ms;
        let max_steps = self.params.steps as u64;
        let open = self.steps.newest().copied().unwrap_or(0);

        let mut total = 0u64;
        let mut open_added = 0u64;
        let mut empty = 0u64;
        let rest;
        let add;
        if now >= self.step_limit {
            // The open step is over; the time since may span empty steps.
            empty = ((now - self.step_limit) / step).min(max_steps);
            rest = (now - self.step_limit) % step;
            if empty < max_steps {
                total = open;
                open_added = 1;
            }
            add = (max_steps - open_added - empty).min(count as u64 - 1);
        } else {
            rest = now + step - self.step_limit;
            total = open;
            add = count as u64 - 1;
        }

        total += self
            .steps
            .iter_newest()
            .skip(1)
            .take(add as usize)
            .sum::<u64>();

        let t = (add + open_added + empty) * step + rest;
        if t > 0 { total * 1000 / t } else { 0 }
    }

    /// Pick the progress buffer limit from the speed of the current file's
    /// most recent blocks.
    ///
    /// `file_blocks` is the number of blocks of the current file so far and
    /// `file_start` the tick it started at. Returns `current` when there is
    /// nothing recent enough to measure.
    pub fn adjust_progress_buffer_limit(
        &self,
        current: usize,
        file_blocks: u64,
        file_start: u64,
        now: u64,
    ) -> usize {
        let take = (ASYNC_SLOW_COPY_BUF_MINBLOCKS as u64)
            .min(file_blocks)
            .min(self.packets.len() as u64) as usize;
        let oldest_allowed = now.saturating_sub(BUFFER_LIMIT_MAX_AGE_MS);

        let mut bytes = 0u64;
        let mut kept = 0usize;
        for packet in self.packets.iter_newest().take(take) {
            if packet.time < oldest_allowed {
                break;
            }
            bytes += packet.size;
            kept += 1;
        }
        if kept == 0 {
            return current;
        }

        // The interval starts where the block before the oldest kept one ended.
        let start = match self.packets.get_newest(kept) {
            Some(before) if (kept as u64) < file_blocks => before.time.max(file_start),
            _ => file_start,
        };
        let elapsed = now.saturating_sub(start).max(1);
        let speed = bytes * 1000 / elapsed;

        let hard_max = if self.max_packet_size > 0 {
            self.max_packet_size.min(ASYNC_COPY_BUF_SIZE)
        } else {
            ASYNC_COPY_BUF_SIZE
        };

        let chosen = BUFFER_LIMIT_LADDER
            .iter()
            .copied()
            .find(|&size| {
                let mut capacity = size as u64 * BUFFER_LIMIT_BLOCKS_PER_SEC;
                if size < current {
                    capacity = capacity * 4 / 5;
                } else if size == current {
                    capacity = capacity * 5 / 4;
                }
                speed <= capacity
            })
            .unwrap_or(ASYNC_COPY_BUF_SIZE);

        chosen.min(hard_max).max(ASYNC_SLOW_COPY_BUF_SIZE.min(hard_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sample_is_zero() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        meter.bytes_received(1000, 100, 0);
        assert_eq!(meter.get_speed(150), 0);
    }

    #[test]
    fn test_steady_high_rate() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // 10 KB every 10 ms = 1 MB/s for one second.
        for i in 1..=100u64 {
            meter.bytes_received(10_000, i * 10, 0);
        }
        let speed = meter.get_speed(1000);
        assert!((990_000..=1_010_000).contains(&speed), "speed = {speed}");
    }

    #[test]
    fn test_high_rate_goes_stale() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        for i in 1..=50u64 {
            meter.bytes_received(10_000, i * 10, 0);
        }
        assert!(meter.get_speed(600) > 0);
        assert_eq!(meter.get_speed(500 + 2001), 0);
    }

    #[test]
    fn test_low_rate_uses_packets() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // One 1000-byte packet per second: packet span exceeds 2 s after 4 packets.
        for i in 0..4u64 {
            meter.bytes_received(1000, i * 1000, 0);
        }
        let speed = meter.get_speed(3000);
        assert_eq!(speed, 1000);
    }

    #[test]
    fn test_low_rate_collapse_flags_reset() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        meter.bytes_received(1000, 0, 0);
        meter.bytes_received(1000, 1000, 0);
        meter.bytes_received(1000, 2000, 0);
        // Next packet takes 2x as long: collapse.
        meter.bytes_received(1000, 4000, 0);
        assert_eq!(meter.get_speed(4000), 0);
        assert!(meter.reset_needed());

        meter.just_connected(4000);
        assert!(!meter.reset_needed());
    }

    #[test]
    fn test_progress_meter_does_not_flag_reset() {
        let mut meter = ProgressSpeedMeter::progress();
        meter.just_connected(0);
        for (size, time) in [(1000, 0), (1000, 5000), (1000, 10000), (1000, 40000)] {
            meter.bytes_received(size, time, 0);
        }
        assert_eq!(meter.get_speed(40000), 0);
        assert!(!meter.reset_needed());
    }

    #[test]
    fn test_low_rate_stale() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        for i in 0..4u64 {
            meter.bytes_received(1000, i * 1000, 0);
        }
        assert_eq!(meter.get_speed(3000 + 2001), 0);
    }

    #[test]
    fn test_long_gap_forgets_old_burst() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        meter.bytes_received(50_000, 100, 0);
        meter.bytes_received(50_000, 150, 0);
        // Gap far longer than the whole ring; only the new burst counts.
        meter.bytes_received(10_000, 60_000, 0);
        meter.bytes_received(10_000, 60_100, 0);
        let speed = meter.get_speed(60_100);
        assert!(speed <= 20_000 * 1000 / 4900 + 1, "speed = {speed}");
    }

    #[test]
    fn test_adjust_limit_slow_link_picks_small_buffer() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // 4 KB every 100 ms = 40 KB/s.
        for i in 1..=12u64 {
            meter.bytes_received(4 * 1024, i * 100, 1024 * 1024);
        }
        let limit = meter.adjust_progress_buffer_limit(1024 * 1024, 12, 0, 1200);
        assert_eq!(limit, 8 * 1024);
    }

    #[test]
    fn test_adjust_limit_fast_link_picks_large_buffer() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // 1 MB every 100 ms = 10 MB/s.
        for i in 1..=12u64 {
            meter.bytes_received(1024 * 1024, i * 100, 1024 * 1024);
        }
        let limit = meter.adjust_progress_buffer_limit(8 * 1024, 12, 0, 1200);
        assert_eq!(limit, 1024 * 1024);
    }

    #[test]
    fn test_adjust_limit_skips_medium_sizes() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // ~400 KB/s: above what 32 KB blocks sustain, below 192 KB blocks.
        for i in 1..=12u64 {
            meter.bytes_received(40 * 1024, i * 100, 1024 * 1024);
        }
        let limit = meter.adjust_progress_buffer_limit(8 * 1024, 12, 0, 1200);
        assert_eq!(limit, 192 * 1024);
    }

    #[test]
    fn test_adjust_limit_clamped_to_max_packet() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // 5 MB/s would pick 512 KB blocks.
        for i in 1..=12u64 {
            meter.bytes_received(256 * 1024, i * 50, 256 * 1024);
        }
        let limit = meter.adjust_progress_buffer_limit(8 * 1024, 12, 0, 600);
        assert_eq!(limit, 256 * 1024);
    }

    #[test]
    fn test_adjust_limit_ignores_old_blocks() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        for i in 1..=12u64 {
            meter.bytes_received(8 * 1024, i * 100, 1024 * 1024);
        }
        assert_eq!(
            meter.adjust_progress_buffer_limit(64 * 1024, 12, 0, 10_000),
            64 * 1024
        );
    }

    #[test]
    fn test_adjust_limit_hysteresis_keeps_current() {
        let mut meter = TransferSpeedMeter::transfer();
        meter.just_connected(0);
        // 3.6 MB/s: 320 KB blocks sustain 3.2 MB/s, with +25 % they hold 4 MB/s.
        for i in 1..=12u64 {
            meter.bytes_received(368_640, i * 100, 1024 * 1024);
        }
        assert_eq!(
            meter.adjust_progress_buffer_limit(320 * 1024, 12, 0, 1200),
            320 * 1024
        );
        assert_eq!(
            meter.adjust_progress_buffer_limit(8 * 1024, 12, 0, 1200),
            384 * 1024
        );
    }
}
