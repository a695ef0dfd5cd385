use serde::Deserialize;

/// Tuning knobs of an [`Arq`](crate::Arq) engine.
///
/// The defaults favor latency over fairness: no-delay retransmission timers, a 1ms internal
/// interval, fast resend after a single skipped ack, no congestion window and large windows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    /// Maximum size of an outgoing datagram, segment headers included.
    pub mtu: usize,

    /// Send window, in segments.
    pub send_window: u16,

    /// Receive window, in segments.
    pub recv_window: u16,

    /// Use the no-delay retransmission timers (RTO grows by half instead of doubling).
    pub nodelay: bool,

    /// Internal flush interval, in milliseconds.
    pub interval: u32,

    /// Resend a segment once this many later segments have been acknowledged. 0 disables it.
    pub fast_resend: u32,

    /// Disable the congestion window, leaving only the send and remote windows.
    pub no_congestion: bool,

    /// Lower bound of the retransmission timeout, in milliseconds.
    pub min_rto: u32,

    /// Treat data as a byte stream instead of discrete messages.
    pub stream_mode: bool,

    /// Retransmissions of one segment after which the link is considered dead.
    pub dead_link: u32,
}

impl ArqConfig {
    pub const DEFAULT_MTU: usize = 1400;

    pub const fn new() -> Self {
        Self {
            mtu: Self::DEFAULT_MTU,
            send_window: 8192,
            recv_window: 8192,
            nodelay: true,
            interval: 1,
            fast_resend: 1,
            no_congestion: true,
            min_rto: 5,
            stream_mode: true,
            dead_link: 20,
        }
    }
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self::new()
    }
}
