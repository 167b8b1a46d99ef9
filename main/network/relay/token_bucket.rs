use sim_support::emulated_time::EmulatedTime;
use sim_support::simulation_time::SimulationTime;

use crate::core::worker::Worker;

/// A token bucket. Tokens refill in fixed intervals against the virtual
/// clock; removal beyond the current balance reports how long the caller
/// must wait.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    balance: u64,
    refill_size: u64,
    refill_interval: SimulationTime,
    last_refill: EmulatedTime,
}

impl TokenBucket {
    /// Creates a new bucket, filled to `capacity`. Returns None if any
    /// parameter is zero.
    pub fn new(
        capacity: u64,
        refill_size: u64,
        refill_interval: SimulationTime,
    ) -> Option<TokenBucket> {
        if capacity == 0 || refill_size == 0 || refill_interval.is_zero() {
            return None;
        }

        Some(TokenBucket {
            capacity,
            balance: capacity,
            refill_size,
            refill_interval,
            last_refill: Worker::current_time().unwrap_or(EmulatedTime::SIMULATION_START),
        })
    }

    /// Remove `size` tokens if the bucket (after refilling for elapsed
    /// virtual time) holds at least that many. On failure returns the
    /// duration until enough tokens will be available.
    pub fn conforming_remove(&mut self, size: u64) -> Result<u64, SimulationTime> {
        let now = Worker::current_time().unwrap();
        self.refill(now);

        if size <= self.balance {
            self.balance -= size;
            return Ok(self.balance);
        }

        let deficit = size - self.balance;
        let intervals_needed = deficit.div_ceil(self.refill_size);
        let next_refill = self.refill_interval - (now - self.last_refill);
        let wait = next_refill
            + self
                .refill_interval
                .saturating_mul(intervals_needed.saturating_sub(1));

        Err(wait)
    }

    fn refill(&mut self, now: EmulatedTime) {
        let elapsed = now.duration_since(&self.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        let intervals: u64 = intervals.try_into().unwrap();

        if intervals == 0 {
            return;
        }

        self.balance = self
            .balance
            .saturating_add(self.refill_size.saturating_mul(intervals))
            .min(self.capacity);
        self.last_refill += self.refill_interval.saturating_mul(intervals);
    }
}
