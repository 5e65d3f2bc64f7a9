use crate::comm::timing::Ticks;

/// Number of samples after which the mean switches from a plain average to a rolling update
const WINDOW: u64 = 256;

/// Ack latency statistics of a single queue.
///
/// The mean is a plain average over the first 256 samples. After that, each new sample replaces
///  one 'mean-sized' share of the accumulated sum, approximating an exponential moving average
///  without storing the samples.
#[derive(Debug, Default, Clone)]
pub struct ResponseTimeStats {
    num_samples: u64,
    sum: u64,
    mean: Ticks,
    max: Ticks,
}

impl ResponseTimeStats {
    pub fn add_sample(&mut self, delay: Ticks) {
        if self.num_samples == WINDOW {
            self.sum -= self.mean;
            self.sum += delay;
            let roundoff = if self.sum & 0xff > 127 { 1 } else { 0 };
            self.mean = (self.sum >> 8) + roundoff;
        }
        else {
            self.num_samples += 1;
            self.sum += delay;
            self.mean = self.sum / self.num_samples;
        }

        self.max = self.max.max(delay);
    }

    pub fn mean(&self) -> Ticks {
        self.mean
    }

    pub fn max(&self) -> Ticks {
        self.max
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
