use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use sim_support::simulation_time::SimulationTime;

use crate::core::work::event::EventKind;
use crate::core::work::task::TaskRef;
use crate::host::Host;
use crate::network::packet::{PacketRc, PacketStatus};
use crate::network::relay::token_bucket::TokenBucket;
use crate::network::PacketDevice;

pub mod token_bucket;

/// Where a relay pulls its packets from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelaySource {
    /// The network interface with this address.
    Device(std::net::Ipv4Addr),
    /// The host's upstream router (inbound packets from the internet).
    Router,
}

/// Specifies a throughput limit the relay should enforce when forwarding.
pub enum RateLimit {
    BytesPerSecond(u64),
    Unlimited,
}

/// A `Relay` forwards packets from a source device to destination devices,
/// optionally enforcing a bandwidth limit. The relay is the "active" part of
/// packet forwarding: it initiates transfers and schedules tasks to continue
/// forwarding over time without exceeding the configured rate.
///
/// `Relay::notify()` must be called whenever the source changes state from
/// empty to non-empty, to trigger an idle relay to start forwarding again.
///
/// Packets forwarded between identical source and destination devices are
/// local to that device and exempt from the rate limit.
pub struct Relay {
    /// It is assumed that this is never mutably borrowed outside of
    /// `Relay::forward_until_blocked()`.
    internal: AtomicRefCell<RelayInternal>,
}

struct RelayInternal {
    rate_limiter: Option<TokenBucket>,
    source: RelaySource,
    state: RelayState,
    next_packet: Option<PacketRc>,
}

/// Tracks the relay's state, which typically moves from Idle to Pending to
/// Forwarding, and then back to either Idle or Pending.
#[derive(PartialEq, Copy, Clone, Debug)]
enum RelayState {
    /// Not forwarding and no forwarding event scheduled.
    Idle,
    /// A forwarding event has been scheduled.
    Pending,
    /// The forwarding loop is running.
    Forwarding,
}

/// We always refill at least 1 byte per millisecond.
fn create_token_bucket(bytes_per_second: u64) -> TokenBucket {
    let refill_interval = SimulationTime::from_millis(1);
    let refill_size = std::cmp::max(1, bytes_per_second / 1000);

    // The capacity includes one MTU of burst allowance so that a full packet
    // that doesn't quite fit at the end of an interval doesn't permanently
    // strand the leftover tokens.
    let capacity = refill_size + 1500;

    TokenBucket::new(capacity, refill_size, refill_interval).unwrap()
}

impl Relay {
    pub fn new(rate: RateLimit, source: RelaySource) -> Self {
        let rate_limiter = match rate {
            RateLimit::BytesPerSecond(bytes) => Some(create_token_bucket(bytes)),
            RateLimit::Unlimited => None,
        };

        Self {
            internal: AtomicRefCell::new(RelayInternal {
                rate_limiter,
                source,
                state: RelayState::Idle,
                next_packet: None,
            }),
        }
    }

    /// Notify the relay that its packet source now has packets available.
    /// Must be called when the source changes state from empty to non-empty.
    pub fn notify(self: &Arc<Self>, host: &Host) {
        // The only time we hold a mutable borrow of our internals while
        // executing outside of this module is when we're running the
        // forwarding loop, and forwarding packets can cause a call back into
        // `Relay::notify()`. So it's safe to assume we are in the Forwarding
        // state if the borrow fails.
        let state = match self.internal.try_borrow() {
            Ok(internal) => internal.state,
            Err(_) => RelayState::Forwarding,
        };

        match state {
            RelayState::Idle => {
                // allow packets to accumulate and unwind the stack before
                // forwarding them
                self.forward_later(SimulationTime::ZERO, host);
            }
            RelayState::Pending | RelayState::Forwarding => {
                log::trace!("Relay forward already scheduled or running; skipping request.");
            }
        }
    }

    /// Schedule an event to run the forwarding loop later. Must not be called
    /// while in the Pending state.
    fn forward_later(self: &Arc<Self>, delay: SimulationTime, host: &Host) {
        {
            let mut internal = self.internal.borrow_mut();
            assert_ne!(internal.state, RelayState::Pending);
            internal.state = RelayState::Pending;
        }

        // a weak reference, so the relay can be dropped before the task runs
        let weak_self = Arc::downgrade(self);
        let task = TaskRef::new(move |host| Self::run_forward_task(&weak_self, host));
        host.schedule_task_with_delay(task, delay, EventKind::InterfaceSent);
    }

    fn run_forward_task(weak_self: &Weak<Self>, host: &Host) {
        let Some(strong_self) = Weak::upgrade(weak_self) else {
            log::trace!("Relay no longer exists; skipping forward task.");
            return;
        };

        strong_self.internal.borrow_mut().state = RelayState::Idle;
        strong_self.forward_now(host);
    }

    /// Runs the forward loop, and then schedules a task to run it again if
    /// rate limiting blocked it.
    fn forward_now(self: &Arc<Self>, host: &Host) {
        if let Some(blocking_dur) = self.forward_until_blocked(host) {
            self.forward_later(blocking_dur, host);
        }
    }

    /// Forward packets from the source to destination devices until we run
    /// out of either tokens or packets. Returns the duration until enough
    /// tokens are available when blocked by the rate limit.
    fn forward_until_blocked(self: &Arc<Self>, host: &Host) -> Option<SimulationTime> {
        let mut internal = self.internal.borrow_mut();
        internal.state = RelayState::Forwarding;
        let source = internal.source;

        loop {
            // the next packet from the local cache, or from the source device
            let next = internal.next_packet.take().or_else(|| match source {
                RelaySource::Device(addr) => host.interface_for(addr).and_then(|x| x.pop(host)),
                RelaySource::Router => host.pop_router_packet(),
            });

            let Some(packet) = next else {
                internal.state = RelayState::Idle;
                return None;
            };

            // Local packets (source device delivers to itself, e.g. over
            // loopback) are exempt from rate limits.
            let src_addr = match source {
                RelaySource::Device(addr) => Some(addr),
                RelaySource::Router => None,
            };
            let is_local = src_addr == Some(*packet.dst_address().ip());

            if !is_local {
                if let Some(tb) = internal.rate_limiter.as_mut() {
                    if let Err(blocking_dur) = tb.conforming_remove(packet.total_size() as u64) {
                        log::trace!(
                            "Relay exceeded rate limit, packet of size {} blocked for {:?}",
                            packet.total_size(),
                            blocking_dur
                        );

                        // cache the packet until we can forward it later
                        packet.add_status(PacketStatus::RELAY_CACHED);
                        assert!(internal.next_packet.is_none());
                        internal.next_packet = Some(packet);
                        internal.state = RelayState::Idle;

                        // Relay::forward_later runs after this borrow drops
                        return Some(blocking_dur);
                    }
                }
            }

            packet.add_status(PacketStatus::RELAY_FORWARDED);
            host.deliver_packet(packet);
        }
    }
}
