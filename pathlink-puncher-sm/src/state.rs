use std::num::NonZeroU32;

/// The state of a [`Puncher`](crate::Puncher).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuncherState {
    /// Not punching. Nothing is sent until [`start`](crate::Puncher::start) is called.
    Idle,

    /// Sending punch datagrams on a fixed interval, waiting for the peer's answer.
    Punching,

    /// The peer answered and assigned this stream id. No more punches are sent.
    Ready(NonZeroU32),

    /// Every allowed attempt was sent without an answer. Stays here until reset.
    Exhausted,
}

impl PuncherState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn stream_id(&self) -> Option<NonZeroU32> {
        match self {
            Self::Ready(id) => Some(*id),
            _ => None,
        }
    }
}

/// What happened with a stream id received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// First answer: the id is now the stream id.
    Accepted(NonZeroU32),

    /// The same id was already accepted. A repeated answer to a repeated punch.
    Duplicate,

    /// A different id arrived after one was accepted. The accepted id is kept.
    Foreign { accepted: NonZeroU32, received: NonZeroU32 },

    /// No punch is in progress (idle or exhausted), so the answer is ignored.
    Unsolicited,
}
