mod state;

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use std::time::Instant;

pub use crate::state::*;

/// Where and which punch datagram to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    pub to: SocketAddr,

    /// 1-based number of this attempt.
    pub attempt: u32,
}

/// The possible actions the user of a puncher state machine should do after polling the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuncherAction {
    /// Nothing to do. Punching hasn't been started or was reset.
    Idle,

    /// Wait for the peer's answer or for the next timer tick.
    Wait,

    /// The peer answered with this stream id. The reliable stream can be set up on top of the
    /// punched path.
    Ready(NonZeroU32),

    /// All attempts were sent and none was answered. The path stays unusable until the puncher is
    /// started again.
    Exhausted,
}

/// Drives the punching schedule: one punch right away, then one per tick period, up to a fixed
/// amount of attempts. The first stream id the peer answers with wins.
#[derive(Debug)]
pub struct Puncher {
    state: PuncherState,
    remote_address: Option<SocketAddr>,
    max_attempts: NonZeroU32,
    attempts: u32,
    tick_period: Duration,
    next_tick_instant: Instant,
    needs_send: bool,
}

impl Puncher {
    pub fn new(max_attempts: NonZeroU32, tick_period: Duration) -> Self {
        Self {
            state: PuncherState::Idle,
            remote_address: None,
            max_attempts,
            attempts: 0,
            tick_period,
            next_tick_instant: Instant::now(),
            needs_send: false,
        }
    }

    pub fn state(&self) -> PuncherState {
        self.state
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> NonZeroU32 {
        self.max_attempts
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Starts punching towards `remote_address`, discarding any previous progress. The first punch
    /// is available from [`poll_send`](Self::poll_send) immediately.
    pub fn start(&mut self, remote_address: SocketAddr, now: Instant) {
        self.state = PuncherState::Punching;
        self.remote_address = Some(remote_address);
        self.attempts = 0;
        self.needs_send = true;
        self.next_tick_instant = now + self.tick_period;
    }

    /// Goes back to [`PuncherState::Idle`], forgetting the remote and any accepted stream id.
    pub fn reset(&mut self) {
        self.state = PuncherState::Idle;
        self.remote_address = None;
        self.attempts = 0;
        self.needs_send = false;
    }

    pub fn next_tick_instant(&self) -> Option<Instant> {
        match self.state {
            PuncherState::Punching => Some(self.next_tick_instant),
            _ => None,
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if self.state != PuncherState::Punching {
            return;
        }

        self.next_tick_instant += self.tick_period;
        if self.next_tick_instant <= now {
            self.next_tick_instant = now + self.tick_period;
        }

        // The last attempt got a whole period to be answered.
        if self.attempts >= self.max_attempts.get() {
            self.state = PuncherState::Exhausted;
            self.needs_send = false;
        } else {
            self.needs_send = true;
        }
    }

    /// Returns the punch to send now, if any. Each returned value counts as one attempt.
    pub fn poll_send(&mut self) -> Option<SendInfo> {
        if !self.needs_send || self.state != PuncherState::Punching || self.attempts >= self.max_attempts.get() {
            return None;
        }

        let to = self.remote_address?;
        self.needs_send = false;
        self.attempts += 1;

        Some(SendInfo {
            to,
            attempt: self.attempts,
        })
    }

    /// Processes a stream id assigned by the peer.
    pub fn received_init(&mut self, stream_id: NonZeroU32) -> InitOutcome {
        match self.state {
            PuncherState::Punching => {
                self.state = PuncherState::Ready(stream_id);
                self.needs_send = false;
                InitOutcome::Accepted(stream_id)
            }
            PuncherState::Ready(accepted) if accepted == stream_id => InitOutcome::Duplicate,
            PuncherState::Ready(accepted) => InitOutcome::Foreign {
                accepted,
                received: stream_id,
            },
            PuncherState::Idle | PuncherState::Exhausted => InitOutcome::Unsolicited,
        }
    }

    pub fn poll(&self) -> PuncherAction {
        match self.state {
            PuncherState::Idle => PuncherAction::Idle,
            PuncherState::Punching => PuncherAction::Wait,
            PuncherState::Ready(stream_id) => PuncherAction::Ready(stream_id),
            PuncherState::Exhausted => PuncherAction::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(1);

    fn remote() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    fn puncher(max: u32) -> Puncher {
        Puncher::new(NonZeroU32::new(max).unwrap(), PERIOD)
    }

    #[test]
    fn test_attempt_cap() {
        let mut puncher = puncher(10);
        let start = Instant::now();
        puncher.start(remote(), start);

        let mut sent = 0;
        let mut now = start;
        for _ in 0..50 {
            while let Some(info) = puncher.poll_send() {
                assert_eq!(info.to, remote());
                sent += 1;
                assert_eq!(info.attempt, sent);
            }

            match puncher.next_tick_instant() {
                Some(instant) => {
                    now = instant;
                    puncher.tick(now);
                }
                None => break,
            }
        }

        assert_eq!(sent, 10);
        assert_eq!(puncher.poll(), PuncherAction::Exhausted);
        assert_eq!(puncher.next_tick_instant(), None);
        assert_eq!(now, start + PERIOD * 10);

        puncher.tick(now + PERIOD);
        assert_eq!(puncher.poll_send(), None);
        assert_eq!(puncher.received_init(NonZeroU32::new(5).unwrap()), InitOutcome::Unsolicited);
    }

    #[test]
    fn test_first_punch_is_immediate() {
        let mut puncher = puncher(3);
        assert_eq!(puncher.poll_send(), None);

        let now = Instant::now();
        puncher.start(remote(), now);
        assert_eq!(puncher.poll_send().map(|info| info.attempt), Some(1));
        assert_eq!(puncher.poll_send(), None);
        assert_eq!(puncher.next_tick_instant(), Some(now + PERIOD));
    }

    #[test]
    fn test_first_stream_id_wins() {
        let mut puncher = puncher(10);
        puncher.start(remote(), Instant::now());
        puncher.poll_send();

        let first = NonZeroU32::new(1234).unwrap();
        let second = NonZeroU32::new(99).unwrap();

        assert_eq!(puncher.received_init(first), InitOutcome::Accepted(first));
        assert_eq!(puncher.received_init(first), InitOutcome::Duplicate);
        assert_eq!(
            puncher.received_init(second),
            InitOutcome::Foreign {
                accepted: first,
                received: second
            }
        );
        assert_eq!(puncher.poll(), PuncherAction::Ready(first));
        assert_eq!(puncher.next_tick_instant(), None);
        assert_eq!(puncher.poll_send(), None);
    }

    #[test]
    fn test_reset_allows_restart() {
        let mut puncher = puncher(1);
        let now = Instant::now();
        puncher.start(remote(), now);
        puncher.poll_send();
        puncher.tick(now + PERIOD);
        assert_eq!(puncher.state(), PuncherState::Exhausted);

        puncher.reset();
        assert_eq!(puncher.poll(), PuncherAction::Idle);
        assert_eq!(puncher.remote_address(), None);

        puncher.start(remote(), now + PERIOD);
        assert_eq!(puncher.attempts(), 0);
        assert!(puncher.poll_send().is_some());
    }
}
