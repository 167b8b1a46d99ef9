/// RFC 7323 limits the shift to 14.
const MAX_SHIFT: u8 = 14;

/// Window-scale negotiation. Both sides must offer the option in their SYN
/// for scaling to apply; otherwise windows are exchanged unscaled.
#[derive(Copy, Clone, Debug)]
pub(crate) struct WindowScaling {
    enabled_locally: bool,
    /// Shift applied to windows we announce. `None` until negotiated.
    recv_shift: Option<u8>,
    /// Shift applied to windows the peer announces.
    send_shift: Option<u8>,
}

impl WindowScaling {
    pub fn new(enabled_locally: bool) -> Self {
        Self {
            enabled_locally,
            recv_shift: None,
            send_shift: None,
        }
    }

    /// The shift to include in our SYN, if any.
    pub fn syn_option(&self, recv_buffer_max: u32) -> Option<u8> {
        self.enabled_locally
            .then(|| Self::shift_for_buffer(recv_buffer_max))
    }

    /// The smallest shift that lets the buffer size fit a 16-bit window.
    pub fn shift_for_buffer(buffer: u32) -> u8 {
        let mut shift = 0;
        while (buffer >> shift) > u16::MAX.into() && shift < MAX_SHIFT {
            shift += 1;
        }
        shift
    }

    /// Complete negotiation from the peer's SYN. Scaling only applies if both
    /// sides offered it.
    pub fn negotiate(&mut self, peer_shift: Option<u8>, recv_buffer_max: u32) {
        match (self.enabled_locally, peer_shift) {
            (true, Some(peer_shift)) => {
                self.recv_shift = Some(Self::shift_for_buffer(recv_buffer_max));
                self.send_shift = Some(peer_shift.min(MAX_SHIFT));
            }
            _ => {
                self.recv_shift = Some(0);
                self.send_shift = Some(0);
            }
        }
    }

    /// Scale down a window for announcement in an outgoing header. Windows in
    /// SYN segments are never scaled.
    pub fn announce(&self, window: u32, is_syn: bool) -> u16 {
        let shift = if is_syn {
            0
        } else {
            self.recv_shift.unwrap_or(0)
        };
        (window >> shift).try_into().unwrap_or(u16::MAX)
    }

    /// Scale up a window received from the peer.
    pub fn apply(&self, window: u16, is_syn: bool) -> u32 {
        let shift = if is_syn {
            0
        } else {
            self.send_shift.unwrap_or(0)
        };
        u32::from(window) << shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_for_buffer() {
        assert_eq!(WindowScaling::shift_for_buffer(1000), 0);
        assert_eq!(WindowScaling::shift_for_buffer(65535), 0);
        assert_eq!(WindowScaling::shift_for_buffer(65536), 1);
        assert_eq!(WindowScaling::shift_for_buffer(174760), 2);
        assert_eq!(WindowScaling::shift_for_buffer(u32::MAX), 14);
    }

    #[test]
    fn test_negotiated() {
        let mut ws = WindowScaling::new(true);
        assert_eq!(ws.syn_option(174760), Some(2));

        ws.negotiate(Some(3), 174760);
        assert_eq!(ws.announce(174760, false), (174760u32 >> 2) as u16);
        assert_eq!(ws.apply(1000, false), 1000 << 3);

        // windows in SYN segments are unscaled
        assert_eq!(ws.apply(1000, true), 1000);
    }

    #[test]
    fn test_peer_declined() {
        let mut ws = WindowScaling::new(true);
        ws.negotiate(None, 174760);
        assert_eq!(ws.announce(174760, false), u16::MAX);
        assert_eq!(ws.apply(1000, false), 1000);
    }

    #[test]
    fn test_disabled_locally() {
        let mut ws = WindowScaling::new(false);
        assert_eq!(ws.syn_option(174760), None);
        ws.negotiate(Some(7), 174760);
        assert_eq!(ws.apply(1000, false), 1000);
    }
}
