use std::fmt;

/// Queue pair state.
///
/// Discriminants are the libibverbs `ibv_qp_state` values. A reliable
/// connection walks `Reset -> Init -> Rtr -> Rts`; `Error` is reachable from
/// every state and only left by destroying the queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QpState {
    /// Freshly created, or reset. Nothing may be posted.
    Reset = 0,
    /// Bound to a port with remote access flags. Receives may be posted to
    /// the hardware, but nothing is processed yet.
    Init = 1,
    /// Ready to receive: bound to a peer queue pair and path.
    Rtr = 2,
    /// Ready to send: fully operational.
    Rts = 3,
    /// Send queue draining.
    Sqd = 4,
    /// Send queue error. Receives are still processed.
    Sqe = 5,
    /// Error: all outstanding work requests are flushed.
    Error = 6,
    /// The state could not be determined.
    Unknown = 7,
}

impl QpState {
    /// Decode a raw `ibv_qp_state` value; out-of-range values map to `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            6 => QpState::Error,
            _ => QpState::Unknown,
        }
    }

    /// Whether receive requests may be submitted in this state.
    #[inline]
    pub fn accepts_recv(self) -> bool {
        matches!(self, QpState::Rtr | QpState::Rts | QpState::Sqd | QpState::Sqe)
    }

    /// Whether send requests may be submitted in this state.
    #[inline]
    pub fn accepts_send(self) -> bool {
        self == QpState::Rts
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Sqd => "SQD",
            QpState::Sqe => "SQE",
            QpState::Error => "ERR",
            QpState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
