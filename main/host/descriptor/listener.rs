use crate::host::descriptor::{FileSignals, FileState};
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

/// When a state listener should be notified about a change to the bits it
/// monitors.
#[derive(Clone, Copy, Debug)]
pub enum StateListenerFilter {
    Never,
    OffToOn,
    OnToOff,
    Always,
}

/// [Handles](Handle) for [event source](StateEventSource) listeners.
pub type StateListenHandle = Handle<(FileState, FileState, FileSignals)>;

/// An event source that passes the new state and the changed bits to each
/// listener, but only if the monitored bits changed in a way that satisfies
/// the listener's filter.
pub struct StateEventSource {
    inner: EventSource<(FileState, FileState, FileSignals)>,
}

impl StateEventSource {
    pub fn new() -> Self {
        Self {
            inner: EventSource::new(),
        }
    }

    /// Add a listener. The filter applies only to state changes, not signals.
    /// Only signals that are monitored will be passed to the listener.
    pub fn add_listener(
        &mut self,
        monitoring_state: FileState,
        monitoring_signals: FileSignals,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, FileSignals, &mut CallbackQueue)
            + Send
            + Sync
            + 'static,
    ) -> StateListenHandle {
        self.inner
            .add_listener(move |(state, changed, signals), cb_queue| {
                // true if any of the bits we're monitoring have changed
                let flipped = monitoring_state.intersects(changed);

                // true if any of the bits we're monitoring are set
                let on = monitoring_state.intersects(state);

                let notify = match filter {
                    // at least one monitored bit is on, and at least one has changed
                    StateListenerFilter::OffToOn => flipped && on,
                    // all monitored bits are off, and at least one has changed
                    StateListenerFilter::OnToOff => flipped && !on,
                    // at least one monitored bit has changed
                    StateListenerFilter::Always => flipped,
                    StateListenerFilter::Never => false,
                };

                // filter the signals to only the ones we're monitoring
                let signals = signals.intersection(monitoring_signals);

                // also want to notify if a monitored signal was emitted
                let notify = notify || !signals.is_empty();

                if !notify {
                    return;
                }

                (notify_fn)(state, changed, signals, cb_queue)
            })
    }

    pub fn notify_listeners(
        &mut self,
        state: FileState,
        changed: FileState,
        signals: FileSignals,
        cb_queue: &mut CallbackQueue,
    ) {
        self.inner
            .notify_listeners((state, changed, signals), cb_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn notify(
        source: &mut StateEventSource,
        state: FileState,
        changed: FileState,
    ) {
        CallbackQueue::queue_and_run(|cb_queue| {
            source.notify_listeners(state, changed, FileSignals::empty(), cb_queue)
        });
    }

    #[test]
    fn test_off_to_on_filter() {
        let mut source = StateEventSource::new();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_clone = Arc::clone(&hits);
        let handle = source.add_listener(
            FileState::READABLE,
            FileSignals::empty(),
            StateListenerFilter::OffToOn,
            move |_, _, _, _| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // turning on notifies
        notify(&mut source, FileState::READABLE, FileState::READABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // turning off does not
        notify(&mut source, FileState::empty(), FileState::READABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // unrelated bits do not
        notify(&mut source, FileState::WRITABLE, FileState::WRITABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        handle.stop_listening();
        notify(&mut source, FileState::READABLE, FileState::READABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
