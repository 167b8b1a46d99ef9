use crate::host::descriptor::epoll::EpollEvents;
use crate::host::descriptor::listener::StateListenHandle;
use crate::host::descriptor::{FileSignals, FileState};

/// Used to track the status of a file we are monitoring for events. Any
/// complicated logic for deciding when a file has events that epoll should
/// report should be specified in this object's implementation.
pub(super) struct Entry {
    /// Priority value among other ready entries.
    priority: Option<u64>,
    /// The events of interest registered by the managed process.
    interest: EpollEvents,
    /// The data registered by the managed process, returned upon event
    /// notification.
    data: u64,
    /// The handle to the currently registered file status listener.
    listener_handle: Option<StateListenHandle>,
    /// The current state of the file.
    state: FileState,
    /// The file state changes we have already reported since the state last
    /// changed. When a state changes, that event becomes uncollected until
    /// `collect_ready_events` is called.
    collected: FileState,
}

impl Entry {
    pub fn new(interest: EpollEvents, data: u64, state: FileState) -> Self {
        Self {
            priority: None,
            interest,
            data,
            listener_handle: None,
            state,
            collected: FileState::empty(),
        }
    }

    pub fn modify(&mut self, interest: EpollEvents, data: u64, state: FileState) {
        self.interest = interest;
        self.data = data;
        self.state = state;
        self.collected = FileState::empty();
    }

    pub fn set_priority(&mut self, priority: Option<u64>) {
        self.priority = priority;
    }

    pub fn priority(&self) -> Option<u64> {
        self.priority
    }

    pub fn notify(&mut self, new_state: FileState, changed: FileState, signals: FileSignals) {
        self.state = new_state;
        self.collected.remove(changed);

        if signals.contains(FileSignals::READ_BUFFER_GREW) {
            // more data arrived; an edge-triggered entry must report again
            // even though the readable bit never flipped
            self.collected.remove(FileState::READABLE);
        }
    }

    /// The file states this entry needs to watch for its registered interest.
    pub fn get_listener_state(&self) -> FileState {
        Self::state_from_events(self.interest).union(FileState::CLOSED)
    }

    /// The signals this entry needs to watch.
    pub fn get_listener_signals(&self) -> FileSignals {
        if self.interest.contains(EpollEvents::EPOLLIN | EpollEvents::EPOLLET) {
            FileSignals::READ_BUFFER_GREW
        } else {
            FileSignals::empty()
        }
    }

    pub fn set_listener_handle(&mut self, handle: Option<StateListenHandle>) {
        self.listener_handle = handle;
    }

    pub fn has_ready_events(&self) -> bool {
        !self.state.contains(FileState::CLOSED) && !self.get_ready_events().is_empty()
    }

    pub fn collect_ready_events(&mut self) -> Option<(EpollEvents, u64)> {
        let events = self.get_ready_events();

        if events.is_empty() {
            return None;
        }

        self.collected.insert(Self::state_from_events(events));

        if self.interest.contains(EpollEvents::EPOLLONESHOT) {
            self.interest.remove(events)
        }

        Some((events, self.data))
    }

    fn get_ready_events(&self) -> EpollEvents {
        let events = Self::events_from_state(self.get_ready_state());
        // error and hang-up events are always reported regardless of interest
        let implicit = events & (EpollEvents::EPOLLERR | EpollEvents::EPOLLHUP);
        (self.interest & events) | implicit
    }

    fn get_ready_state(&self) -> FileState {
        if self.interest.contains(EpollEvents::EPOLLET) {
            // Edge-triggered: report an event, then don't report again until
            // that state changes.
            self.state.difference(self.collected)
        } else {
            // Level-triggered: report an event, keep reporting until the
            // state turns off.
            self.state
        }
    }

    fn events_from_state(state: FileState) -> EpollEvents {
        let mut events = EpollEvents::empty();

        if state.intersects(FileState::READABLE | FileState::SOCKET_ALLOWING_CONNECT) {
            events.insert(EpollEvents::EPOLLIN);
        }
        if state.intersects(FileState::WRITABLE) {
            events.insert(EpollEvents::EPOLLOUT);
        }
        if state.intersects(FileState::ERROR) {
            events.insert(EpollEvents::EPOLLERR);
        }
        if state.intersects(FileState::HUP) {
            events.insert(EpollEvents::EPOLLHUP);
        }

        events
    }

    fn state_from_events(events: EpollEvents) -> FileState {
        let mut state = FileState::empty();

        if events.intersects(EpollEvents::EPOLLIN) {
            state.insert(FileState::READABLE | FileState::SOCKET_ALLOWING_CONNECT)
        }
        if events.intersects(EpollEvents::EPOLLOUT) {
            state.insert(FileState::WRITABLE)
        }
        if events.intersects(EpollEvents::EPOLLERR) {
            state.insert(FileState::ERROR)
        }
        if events.intersects(EpollEvents::EPOLLHUP) {
            state.insert(FileState::HUP)
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: u64 = 1234;

    fn poll_init(init: FileState, interest: EpollEvents) {
        let mut entry = Entry::new(interest, DATA, init);
        assert!(entry.has_ready_events());

        let (ev, data) = entry.collect_ready_events().unwrap();
        assert!(interest.contains(ev));
        assert_eq!(data, DATA);
    }

    #[test]
    fn poll_init_r() {
        poll_init(FileState::READABLE, EpollEvents::EPOLLIN);
    }

    #[test]
    fn poll_init_w() {
        poll_init(FileState::WRITABLE, EpollEvents::EPOLLOUT);
    }

    #[test]
    fn poll_init_rw() {
        let init = FileState::READABLE | FileState::WRITABLE;
        poll_init(init, EpollEvents::EPOLLIN);
        poll_init(init, EpollEvents::EPOLLOUT);
        poll_init(init, EpollEvents::EPOLLIN | EpollEvents::EPOLLOUT);
    }

    /// Checks that an entry starting in state `init` is only ready after
    /// `change_on` turns on when waiting for `interest`.
    fn poll_on_state(init: FileState, interest: EpollEvents, change_on: FileState) {
        let mut entry = Entry::new(interest, DATA, init);
        assert!(!entry.has_ready_events());

        entry.notify(init.union(change_on), change_on, FileSignals::empty());
        assert!(entry.has_ready_events());

        let (ev, data) = entry.collect_ready_events().unwrap();
        assert!(interest.contains(ev));
        assert_eq!(data, DATA);
    }

    #[test]
    fn poll_on_r() {
        let on = FileState::READABLE;
        poll_on_state(FileState::empty(), EpollEvents::EPOLLIN, on);
        poll_on_state(FileState::WRITABLE, EpollEvents::EPOLLIN, on);
    }

    #[test]
    fn poll_on_w() {
        let on = FileState::WRITABLE;
        poll_on_state(FileState::empty(), EpollEvents::EPOLLOUT, on);
        poll_on_state(FileState::READABLE, EpollEvents::EPOLLOUT, on);
    }

    #[test]
    fn level_trigger() {
        let in_lt = EpollEvents::EPOLLIN;
        let mut entry = Entry::new(in_lt, DATA, FileState::empty());
        assert!(!entry.has_ready_events());

        entry.notify(FileState::READABLE, FileState::READABLE, FileSignals::empty());
        assert!(entry.has_ready_events());

        for _ in 0..3 {
            assert_eq!(
                entry.collect_ready_events(),
                Some((EpollEvents::EPOLLIN, DATA))
            );
            assert!(entry.has_ready_events());
        }
    }

    #[test]
    fn edge_trigger() {
        let in_et = EpollEvents::EPOLLIN | EpollEvents::EPOLLET;
        let mut entry = Entry::new(in_et, DATA, FileState::empty());
        assert!(!entry.has_ready_events());

        entry.notify(FileState::READABLE, FileState::READABLE, FileSignals::empty());

        assert!(entry.has_ready_events());
        assert_eq!(
            entry.collect_ready_events(),
            Some((EpollEvents::EPOLLIN, DATA))
        );

        // event was collected and should only be reported once
        assert!(!entry.has_ready_events());
        assert_eq!(entry.collect_ready_events(), None);

        // nothing changed, so still no events
        entry.notify(FileState::READABLE, FileState::empty(), FileSignals::empty());
        assert!(!entry.has_ready_events());

        // but more arriving data re-arms the edge even though the bit never
        // flipped off
        entry.notify(
            FileState::READABLE,
            FileState::empty(),
            FileSignals::READ_BUFFER_GREW,
        );
        assert!(entry.has_ready_events());
    }

    #[test]
    fn one_shot() {
        let in_os = EpollEvents::EPOLLIN | EpollEvents::EPOLLONESHOT;
        let mut entry = Entry::new(in_os, DATA, FileState::empty());

        entry.notify(FileState::READABLE, FileState::READABLE, FileSignals::empty());

        assert!(entry.has_ready_events());
        assert_eq!(
            entry.collect_ready_events(),
            Some((EpollEvents::EPOLLIN, DATA))
        );

        // never reported again until the entry is reset with EPOLL_CTL_MOD
        assert!(!entry.has_ready_events());
        entry.notify(FileState::empty(), FileState::READABLE, FileSignals::empty());
        entry.notify(FileState::READABLE, FileState::READABLE, FileSignals::empty());
        assert!(!entry.has_ready_events());

        entry.modify(in_os, DATA, FileState::READABLE);
        assert!(entry.has_ready_events());
    }
}
