use crate::wire::Message;

/// Choke and interest flags of one connection, from the local peer
/// perspective.
///
/// Every setter is idempotent and returns `true` only when the flag actually
/// changed, so the caller knows if a message must go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeState {
    /// Client is choking the peer.
    pub am_choking: bool,
    /// Client is interested in downloading from peer.
    pub am_interested: bool,
    /// The peer is choking the client.
    pub peer_choking: bool,
    /// The peer is interested in downloading from client.
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

fn set(flag: &mut bool, value: bool) -> bool {
    let changed = *flag != value;
    *flag = value;
    changed
}

impl ChokeState {
    pub fn remote_choke(&mut self) -> bool {
        set(&mut self.peer_choking, true)
    }

    pub fn remote_unchoke(&mut self) -> bool {
        set(&mut self.peer_choking, false)
    }

    pub fn remote_interested(&mut self) -> bool {
        set(&mut self.peer_interested, true)
    }

    pub fn remote_not_interested(&mut self) -> bool {
        set(&mut self.peer_interested, false)
    }

    pub fn set_am_choking(&mut self, choking: bool) -> bool {
        set(&mut self.am_choking, choking)
    }

    pub fn set_am_interested(&mut self, interested: bool) -> bool {
        set(&mut self.am_interested, interested)
    }

    /// We may send requests to the peer.
    pub fn can_request(&self) -> bool {
        !self.peer_choking
    }

    /// We may send blocks to the peer.
    pub fn can_serve(&self) -> bool {
        !self.am_choking
    }

    /// If `msg` may be written to the socket in the current state. A request
    /// sent while the peer is choking us would be silently dropped by the
    /// remote, a piece sent while we choke is not allowed at all.
    pub fn allows_outbound(&self, msg: &Message) -> bool {
        match msg {
            Message::Request(_) => self.can_request(),
            Message::Piece(_) => self.can_serve(),
            _ => true,
        }
    }

    /// Compact form for logs: `am_choking am_interested peer_choking
    /// peer_interested`, a dash when false.
    pub fn log(&self) -> String {
        [
            (self.am_choking, 'c'),
            (self.am_interested, 'i'),
            (self.peer_choking, 'C'),
            (self.peer_interested, 'I'),
        ]
        .iter()
        .map(|(b, c)| if *b { *c } else { '-' })
        .collect()
    }
}
