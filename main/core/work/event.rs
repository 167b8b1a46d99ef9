use sim_support::emulated_time::EmulatedTime;
use sim_support::HostId;

use crate::host::Host;

use super::task::TaskRef;

/// What kind of state change an event represents. Used for tracing and for
/// the determinism checks that compare event sequences across runs; the
/// actual behaviour lives in the event's task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketArrived,
    PacketDropped,
    InterfaceSent,
    TcpRetransmitTimer,
    TcpCloseTimer,
    Callback,
    StartApplication,
    StopApplication,
}

/// A scheduled state change at a (host, time). The sequence number is
/// assigned by the source host at insertion and breaks ties between
/// simultaneous events, guaranteeing FIFO among same-time events.
#[derive(Debug)]
pub struct Event {
    kind: EventKind,
    task: TaskRef,
    time: EmulatedTime,
    src_host_id: HostId,
    dst_host_id: HostId,
    src_host_event_id: u64,
}

impl Event {
    pub fn new(
        kind: EventKind,
        task: TaskRef,
        time: EmulatedTime,
        src_host: &Host,
        dst_host_id: HostId,
    ) -> Self {
        Self {
            kind,
            task,
            time,
            src_host_id: src_host.id(),
            dst_host_id,
            src_host_event_id: src_host.get_new_event_id(),
        }
    }

    pub fn execute(self, host: &Host) {
        // make sure we're executing on the correct host
        assert_eq!(self.host_id(), host.id());

        self.task.execute(host);
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn time(&self) -> EmulatedTime {
        self.time
    }

    pub fn host_id(&self) -> HostId {
        self.dst_host_id
    }

    pub fn set_time(&mut self, time: EmulatedTime) {
        self.time = time;
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.task == other.task
            && self.time == other.time
            && self.src_host_id == other.src_host_id
            && self.dst_host_id == other.dst_host_id
            && self.src_host_event_id == other.src_host_event_id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        // sort by event time first, then use other fields we're able to compare
        let cmp = self
            .time
            .cmp(&other.time)
            .then_with(|| self.dst_host_id.cmp(&other.dst_host_id))
            .then_with(|| self.src_host_id.cmp(&other.src_host_id))
            .then_with(|| self.src_host_event_id.cmp(&other.src_host_event_id));

        // if the above fields were all equal (this should ideally not occur
        // in practice since it leads to non-determinism, but we handle it
        // anyways)
        if cmp == std::cmp::Ordering::Equal {
            if self.task != other.task {
                // tasks are not equal, so the events must not be equal
                assert_ne!(self, other);
                // we have nothing left to order them by
                return None;
            }

            // tasks are equal, so the events must be equal
            assert_eq!(self, other);
        }

        Some(cmp)
    }
}
