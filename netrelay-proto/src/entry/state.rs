use std::fmt;

/// TCP state of the connection as seen by the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalState {
    /// Slot available for a new connection
    Unused,
    /// Slot claimed, waiting for a SYN
    Listen,
    /// Host's SYN received
    SynRcvd,
    /// SYN sent to the host
    SynSent,
    /// Handshake complete
    Established,
    /// Host finished sending
    CloseWait,
    /// Host finished sending, our FIN awaits its ACK
    LastAck,
    /// Our FIN sent, not yet acknowledged
    FinWait1,
    /// Our FIN acknowledged, host still sending
    FinWait2,
    /// FINs crossed
    Closing,
    /// Both sides finished, lingering for stray segments
    TimeWait,
    /// Connection over
    Closed,
}

/// State of the connection between this relay and the remote proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    /// No remote connection
    Unknown,
    /// Open request to be sent once the tunnel is connected
    WaitingEstablishment,
    /// Open request sent, confirmation pending
    ConnRequestSent,
    /// The peer asked us to open the connection
    ConnRequestReceived,
    /// Both ends confirmed
    ConnEstablished,
    /// We sent a close request
    DisconnRequestSent,
    /// The peer sent a close request
    DisconnRequestReceived,
    /// Remote connection over
    Disconnected,
}

/// Outcome of feeding an event to one of the state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Move to the given state
    To(S),
    /// The event is valid but changes nothing, e.g. a retransmission
    Ignore,
    /// The event cannot happen in the current state
    Inconsistent,
}

impl LocalState {
    /// The host sent a FIN covering everything before it
    pub fn on_fin_received(self) -> Transition<Self> {
        use LocalState::*;
        match self {
            SynRcvd | Established => Transition::To(CloseWait),
            FinWait1 => Transition::To(Closing),
            FinWait2 => Transition::To(TimeWait),
            // Retransmitted FIN; only the ACK is repeated
            CloseWait | LastAck | Closing | TimeWait => Transition::Ignore,
            SynSent | Unused | Listen | Closed => Transition::Inconsistent,
        }
    }

    /// The host acknowledged our FIN
    pub fn on_fin_acked(self) -> Transition<Self> {
        use LocalState::*;
        match self {
            FinWait1 => Transition::To(FinWait2),
            Closing => Transition::To(TimeWait),
            LastAck => Transition::To(Closed),
            FinWait2 | TimeWait => Transition::Ignore,
            Unused | Listen | SynRcvd | SynSent | Established | CloseWait | Closed => {
                Transition::Inconsistent
            }
        }
    }

    /// We sent a FIN to the host
    pub fn on_fin_sent(self) -> Transition<Self> {
        use LocalState::*;
        match self {
            Established => Transition::To(FinWait1),
            CloseWait => Transition::To(LastAck),
            FinWait1 | LastAck | Closing => Transition::Ignore,
            Unused | Listen | SynRcvd | SynSent | FinWait2 | TimeWait | Closed => {
                Transition::Inconsistent
            }
        }
    }

    /// Whether the local state machine is mid-connection
    pub fn is_active(self) -> bool {
        use LocalState::*;
        match self {
            SynRcvd | SynSent | Established | CloseWait | LastAck | FinWait1 | FinWait2
            | Closing | TimeWait => true,
            Unused | Listen | Closed => false,
        }
    }

    /// States in which the host may still send us data
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            LocalState::Established | LocalState::FinWait1 | LocalState::FinWait2
        )
    }

    /// States in which data we queue for the host may be transmitted
    pub fn may_transmit(self) -> bool {
        matches!(
            self,
            LocalState::Established
                | LocalState::CloseWait
                | LocalState::FinWait1
                | LocalState::Closing
        )
    }
}

impl RemoteState {
    /// We sent a close request to the peer
    pub fn on_close_sent(self) -> Transition<Self> {
        use RemoteState::*;
        match self {
            ConnRequestSent | ConnEstablished => Transition::To(DisconnRequestSent),
            DisconnRequestReceived => Transition::To(Disconnected),
            DisconnRequestSent | Disconnected => Transition::Ignore,
            Unknown | WaitingEstablishment | ConnRequestReceived => Transition::Inconsistent,
        }
    }

    /// The peer sent a close request
    pub fn on_close_received(self) -> Transition<Self> {
        use RemoteState::*;
        match self {
            ConnEstablished => Transition::To(DisconnRequestReceived),
            DisconnRequestSent => Transition::To(Disconnected),
            DisconnRequestReceived | Disconnected => Transition::Ignore,
            Unknown | WaitingEstablishment | ConnRequestSent | ConnRequestReceived => {
                Transition::Inconsistent
            }
        }
    }

    /// The peer confirmed the connection we asked for
    pub fn on_open_confirmed(self) -> Transition<Self> {
        use RemoteState::*;
        match self {
            ConnRequestSent => Transition::To(ConnEstablished),
            // Closed locally while the confirmation was in flight
            DisconnRequestSent => Transition::Ignore,
            Unknown | WaitingEstablishment | ConnRequestReceived | ConnEstablished
            | DisconnRequestReceived | Disconnected => Transition::Inconsistent,
        }
    }

    /// Whether the peer holds a connection worth notifying on reset
    pub fn is_open(self) -> bool {
        use RemoteState::*;
        match self {
            ConnRequestSent | ConnRequestReceived | ConnEstablished | DisconnRequestSent
            | DisconnRequestReceived => true,
            Unknown | WaitingEstablishment | Disconnected => false,
        }
    }

    /// Whether host data may flow to the peer
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            RemoteState::ConnEstablished | RemoteState::DisconnRequestReceived
        )
    }

    /// Whether peer data may still reach the host
    pub fn delivers_data(self) -> bool {
        matches!(
            self,
            RemoteState::ConnEstablished | RemoteState::DisconnRequestSent
        )
    }
}

impl fmt::Display for LocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_sequences() {
        use LocalState::*;
        assert_eq!(Established.on_fin_sent(), Transition::To(FinWait1));
        assert_eq!(FinWait1.on_fin_acked(), Transition::To(FinWait2));
        assert_eq!(FinWait2.on_fin_received(), Transition::To(TimeWait));
        assert_eq!(TimeWait.on_fin_received(), Transition::Ignore);

        assert_eq!(FinWait1.on_fin_received(), Transition::To(Closing));
        assert_eq!(Closing.on_fin_acked(), Transition::To(TimeWait));

        assert_eq!(Established.on_fin_received(), Transition::To(CloseWait));
        assert_eq!(CloseWait.on_fin_sent(), Transition::To(LastAck));
        assert_eq!(LastAck.on_fin_acked(), Transition::To(Closed));
        assert_eq!(SynSent.on_fin_received(), Transition::Inconsistent);
    }

    #[test]
    fn remote_handshake() {
        use RemoteState::*;
        assert_eq!(ConnRequestSent.on_open_confirmed(), Transition::To(ConnEstablished));
        assert_eq!(ConnEstablished.on_open_confirmed(), Transition::Inconsistent);
        assert_eq!(ConnEstablished.on_close_received(), Transition::To(DisconnRequestReceived));
        assert_eq!(DisconnRequestReceived.on_close_sent(), Transition::To(Disconnected));
        assert_eq!(ConnEstablished.on_close_sent(), Transition::To(DisconnRequestSent));
        assert_eq!(DisconnRequestSent.on_close_received(), Transition::To(Disconnected));
        assert_eq!(Unknown.on_close_received(), Transition::Inconsistent);
    }
}
