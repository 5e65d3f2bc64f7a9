use std::time::Duration;

use tokio::time::Instant;

/// Time is measured in ticks of 1/60 second
pub type Ticks = u64;

pub const TICKS_PER_SECOND: u64 = 60;

/// Retry and timeout parameters shared by all channels of a manager. The application can adapt
///  them to the measured round trip time at runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// minimum number of ticks between two transmissions of the same packet
    pub retry_delta: Ticks,
    /// maximum number of retransmissions after the first send, `None` for 'rely on timeout alone'
    pub max_retries: Option<u32>,
    /// number of ticks after the first transmission at which an unacknowledged packet is
    ///  declared failed
    pub timeout: Ticks,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            retry_delta: 2,
            max_retries: None,
            timeout: 60,
        }
    }
}

pub fn ticks_to_duration(ticks: Ticks) -> Duration {
    // rounding up ensures that advancing a clock by this duration moves it by at least `ticks`
    let fraction_nanos = ((ticks % TICKS_PER_SECOND) * 1_000_000_000).div_ceil(TICKS_PER_SECOND);
    Duration::from_secs(ticks / TICKS_PER_SECOND) + Duration::from_nanos(fraction_nanos)
}

/// Monotonic tick source, based on tokio's clock so that tests can run with paused time
#[derive(Debug)]
pub struct TickClock {
    epoch: Instant,
}

impl TickClock {
    pub fn new() -> TickClock {
        TickClock {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Ticks {
        let elapsed = Instant::now().duration_since(self.epoch);
        (elapsed.as_nanos() * TICKS_PER_SECOND as u128 / 1_000_000_000) as Ticks
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}
