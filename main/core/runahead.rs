use std::sync::RwLock;

use sim_support::simulation_time::SimulationTime;

/// Decides on the runahead for the next simulation round (the duration of
/// the round).
///
/// A larger runahead improves performance since more hosts and more events
/// can run in parallel during a round, but if the runahead exceeds a packet's
/// latency then the packet is delayed until the next round, beyond its
/// intended arrival time. A fixed runahead of the minimum possible latency is
/// always safe; with dynamic runahead enabled, the bound tightens to the
/// minimum latency actually used so far.
#[derive(Debug)]
pub struct Runahead {
    /// The lowest packet latency used so far in the simulation. Only updated
    /// when dynamic runahead is enabled.
    min_used_latency: RwLock<Option<SimulationTime>>,
    /// The lowest latency possible in the topology (the smallest edge
    /// latency).
    min_possible_latency: SimulationTime,
    is_dynamic: bool,
}

impl Runahead {
    pub fn new(is_dynamic: bool, min_possible_latency: SimulationTime) -> Self {
        assert!(!min_possible_latency.is_zero());

        Self {
            min_used_latency: RwLock::new(None),
            min_possible_latency,
            is_dynamic,
        }
    }

    /// Get the runahead for the next round.
    pub fn get(&self) -> SimulationTime {
        self.min_used_latency
            .read()
            .unwrap()
            .unwrap_or(self.min_possible_latency)
    }

    /// If dynamic runahead is enabled, compare-and-update the stored lowest
    /// packet latency. This may shorten the runahead for future rounds.
    pub fn update_lowest_used_latency(&self, latency: SimulationTime) {
        assert!(latency > SimulationTime::ZERO);

        if !self.is_dynamic {
            return;
        }

        let should_update = |min_used: &Option<SimulationTime>| match min_used {
            Some(min_used) => latency < *min_used,
            None => true,
        };

        // an initial check with only a read lock
        {
            let min_used = self.min_used_latency.read().unwrap();
            if !should_update(&min_used) {
                return;
            }
        }

        {
            let mut min_used = self.min_used_latency.write().unwrap();
            if !should_update(&min_used) {
                return;
            }
            *min_used = Some(latency);
        }

        log::debug!(
            "Runahead for next scheduling rounds updated to {} ns",
            latency.as_nanos()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_runahead() {
        let runahead = Runahead::new(false, SimulationTime::from_millis(10));
        assert_eq!(runahead.get(), SimulationTime::from_millis(10));

        // updates are ignored when dynamic runahead is off
        runahead.update_lowest_used_latency(SimulationTime::from_millis(1));
        assert_eq!(runahead.get(), SimulationTime::from_millis(10));
    }

    #[test]
    fn test_dynamic_runahead_tightens() {
        let runahead = Runahead::new(true, SimulationTime::from_millis(10));
        assert_eq!(runahead.get(), SimulationTime::from_millis(10));

        runahead.update_lowest_used_latency(SimulationTime::from_millis(5));
        assert_eq!(runahead.get(), SimulationTime::from_millis(5));

        // only ever tightens
        runahead.update_lowest_used_latency(SimulationTime::from_millis(7));
        assert_eq!(runahead.get(), SimulationTime::from_millis(5));
    }
}
