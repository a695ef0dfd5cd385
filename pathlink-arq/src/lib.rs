//! A sans-IO automatic repeat request engine following the KCP protocol.
//!
//! The engine never touches a socket. The user feeds received datagrams through [`Arq::input`],
//! drives its clock with [`Arq::update`] and pulls outgoing datagrams with [`Arq::poll_transmit`].
//! Application bytes go in with [`Arq::send`] and come out, reordered and deduplicated, with
//! [`Arq::recv`].

mod config;
mod segment;

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use crate::config::ArqConfig;
pub use crate::segment::{Command, SEGMENT_HEADER_SIZE};

use crate::segment::{time_diff, Segment, SegmentHeader};

const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;
const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;
const DEFAULT_REMOTE_WINDOW: u32 = 128;
const MIN_RECV_WINDOW: u16 = 128;
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;
const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const FAST_ACK_LIMIT: u32 = 5;
const MIN_MTU: usize = 50;

/// The most fragments a single message may be split in (message mode only).
pub const MAX_FRAGMENTS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArqError {
    #[error("cannot send an empty buffer")]
    EmptySend,

    #[error("message would need {0} fragments, the maximum is {MAX_FRAGMENTS}")]
    TooManyFragments(usize),

    #[error("packet is truncated")]
    Truncated,

    #[error("segment belongs to conversation {found}, expected {expected}")]
    ConvMismatch { expected: u32, found: u32 },

    #[error("unknown segment command {0}")]
    UnknownCommand(u8),

    #[error("MTU of {0} bytes is too small")]
    InvalidMtu(usize),
}

pub struct Arq {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    xmit: u32,

    nodelay: bool,
    fast_resend: u32,
    no_cwnd: bool,
    stream: bool,
    dead_link: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    ack_list: Vec<(u32, u32)>,

    buffer: BytesMut,
    outbound: VecDeque<Bytes>,
}

impl Arq {
    pub fn new(conv: u32, config: &ArqConfig) -> Result<Self, ArqError> {
        if config.mtu < MIN_MTU {
            return Err(ArqError::InvalidMtu(config.mtu));
        }

        Ok(Self {
            conv,
            mtu: config.mtu,
            mss: config.mtu - SEGMENT_HEADER_SIZE,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEFAULT,
            rx_minrto: config.min_rto,
            snd_wnd: config.send_window.max(1) as u32,
            rcv_wnd: config.recv_window.max(MIN_RECV_WINDOW) as u32,
            rmt_wnd: DEFAULT_REMOTE_WINDOW,
            cwnd: 0,
            incr: 0,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            current: 0,
            interval: config.interval.clamp(1, 5000),
            ts_flush: 0,
            updated: false,
            xmit: 0,
            nodelay: config.nodelay,
            fast_resend: config.fast_resend,
            no_cwnd: config.no_congestion,
            stream: config.stream_mode,
            dead_link: config.dead_link,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            ack_list: Vec::new(),
            buffer: BytesMut::with_capacity(config.mtu),
            outbound: VecDeque::new(),
        })
    }

    /// The conversation id, which every segment of this connection starts with.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Whether a segment was retransmitted so many times that the link should be given up on.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// The amount of segments queued or in flight.
    pub fn waiting_send(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    /// Total retransmissions so far.
    pub fn retransmissions(&self) -> u32 {
        self.xmit
    }

    /// Queues bytes for reliable delivery. In stream mode, small writes are merged into the last
    /// unsent segment.
    pub fn send(&mut self, mut data: &[u8]) -> Result<usize, ArqError> {
        if data.is_empty() {
            return Err(ArqError::EmptySend);
        }

        let total = data.len();

        if self.stream {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < self.mss {
                    let extend = (self.mss - last.data.len()).min(data.len());
                    last.data.extend_from_slice(&data[..extend]);
                    last.frg = 0;
                    data = &data[extend..];
                }
            }

            if data.is_empty() {
                return Ok(total);
            }
        }

        let count = data.len().div_ceil(self.mss).max(1);
        if !self.stream && count >= MAX_FRAGMENTS {
            return Err(ArqError::TooManyFragments(count));
        }

        for i in 0..count {
            let size = data.len().min(self.mss);
            let frg = match self.stream {
                true => 0,
                false => (count - i - 1) as u8,
            };

            self.snd_queue.push_back(Segment::with_data(BytesMut::from(&data[..size]), frg));
            data = &data[size..];
        }

        Ok(total)
    }

    /// Moves the next complete message (or, in stream mode, the next segment) into `out`.
    /// Returns its size, or `None` if nothing is ready.
    pub fn recv(&mut self, out: &mut BytesMut) -> Option<usize> {
        let size = self.peek_size()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        while let Some(segment) = self.rcv_queue.pop_front() {
            out.extend_from_slice(&segment.data);
            if segment.frg == 0 {
                break;
            }
        }

        self.move_to_rcv_queue();

        // The window reopened, tell the remote right away instead of waiting for it to probe.
        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }

        Some(size)
    }

    fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.data.len());
        }

        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }

        let mut size = 0;
        for segment in &self.rcv_queue {
            size += segment.data.len();
            if segment.frg == 0 {
                break;
            }
        }

        Some(size)
    }

    /// Processes a datagram received from the remote.
    pub fn input(&mut self, mut data: &[u8]) -> Result<(), ArqError> {
        if data.len() < SEGMENT_HEADER_SIZE {
            return Err(ArqError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        while data.len() >= SEGMENT_HEADER_SIZE {
            let header = SegmentHeader::parse(data);
            data = &data[SEGMENT_HEADER_SIZE..];

            if header.conv != self.conv {
                return Err(ArqError::ConvMismatch {
                    expected: self.conv,
                    found: header.conv,
                });
            }

            let len = header.len as usize;
            if data.len() < len {
                return Err(ArqError::Truncated);
            }

            let cmd = Command::try_from(header.cmd).map_err(|_| ArqError::UnknownCommand(header.cmd))?;

            self.rmt_wnd = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match cmd {
                Command::Ack => {
                    // The timestamp is echoed by the remote; samples outside the RTO range are bogus.
                    let rtt = time_diff(self.current, header.ts);
                    if (0..=RTO_MAX as i32).contains(&rtt) {
                        self.update_ack(rtt);
                    }

                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        Some(sn) if time_diff(header.sn, sn) <= 0 => Some(sn),
                        _ => Some(header.sn),
                    };
                }
                Command::Push => {
                    if time_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.ack_list.push((header.sn, header.ts));

                        if time_diff(header.sn, self.rcv_nxt) >= 0 {
                            let mut segment = Segment::with_data(BytesMut::from(&data[..len]), header.frg);
                            segment.sn = header.sn;
                            segment.ts = header.ts;
                            self.parse_data(segment);
                        }
                    }
                }
                Command::WindowAsk => self.probe |= ASK_TELL,
                Command::WindowTell => {}
            }

            data = &data[len..];
        }

        if let Some(sn) = max_ack {
            self.parse_fast_ack(sn);
        }

        if time_diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                self.incr = self.incr.max(mss);
                self.incr += (mss * mss) / self.incr + mss / 16;
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / mss;
                }
            }

            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd * mss;
            }
        }

        Ok(())
    }

    /// Advances the engine's clock to `current` (milliseconds, wrapping) and flushes when the
    /// internal interval has elapsed.
    pub fn update(&mut self, current: u32) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }

            self.flush();
        }
    }

    /// Emits pending acks, window probes, new segments and due retransmissions. Does nothing
    /// before the first [`update`](Self::update).
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();
        let mut buffer = std::mem::take(&mut self.buffer);

        let mut header = SegmentHeader {
            conv: self.conv,
            cmd: Command::Ack.into(),
            frg: 0,
            wnd,
            ts: 0,
            sn: 0,
            una: self.rcv_nxt,
            len: 0,
        };

        for (sn, ts) in self.ack_list.drain(..) {
            make_room(&mut buffer, &mut self.outbound, self.mtu, SEGMENT_HEADER_SIZE);
            header.sn = sn;
            header.ts = ts;
            header.write_to(&mut buffer);
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if time_diff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            header.cmd = Command::WindowAsk.into();
            make_room(&mut buffer, &mut self.outbound, self.mtu, SEGMENT_HEADER_SIZE);
            header.write_to(&mut buffer);
        }

        if self.probe & ASK_TELL != 0 {
            header.cmd = Command::WindowTell.into();
            make_room(&mut buffer, &mut self.outbound, self.mtu, SEGMENT_HEADER_SIZE);
            header.write_to(&mut buffer);
        }

        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.no_cwnd {
            cwnd = cwnd.min(self.cwnd);
        }

        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };

            segment.ts = current;
            segment.sn = self.snd_nxt;
            segment.resend_ts = current;
            segment.rto = self.rx_rto;
            segment.fast_ack = 0;
            segment.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(segment);
        }

        let resent = match self.fast_resend {
            0 => u32::MAX,
            n => n,
        };
        let rto_min = match self.nodelay {
            true => 0,
            false => self.rx_rto >> 3,
        };

        let mut lost = false;
        let mut change = false;

        for segment in self.snd_buf.iter_mut() {
            let mut needs_send = false;

            if segment.xmit == 0 {
                needs_send = true;
                segment.xmit += 1;
                segment.rto = self.rx_rto;
                segment.resend_ts = current.wrapping_add(segment.rto + rto_min);
            } else if time_diff(current, segment.resend_ts) >= 0 {
                needs_send = true;
                segment.xmit += 1;
                self.xmit += 1;
                let step = match self.nodelay {
                    true => segment.rto / 2,
                    false => segment.rto.max(self.rx_rto),
                };
                segment.rto = (segment.rto + step).min(RTO_MAX);
                segment.resend_ts = current.wrapping_add(segment.rto);
                lost = true;
            } else if segment.fast_ack >= resent && segment.xmit <= FAST_ACK_LIMIT {
                needs_send = true;
                segment.xmit += 1;
                segment.fast_ack = 0;
                segment.resend_ts = current.wrapping_add(segment.rto);
                change = true;
            }

            if needs_send {
                segment.ts = current;
                let segment_header = SegmentHeader {
                    conv: self.conv,
                    cmd: Command::Push.into(),
                    frg: segment.frg,
                    wnd,
                    ts: current,
                    sn: segment.sn,
                    una: self.rcv_nxt,
                    len: segment.data.len() as u32,
                };

                make_room(&mut buffer, &mut self.outbound, self.mtu, SEGMENT_HEADER_SIZE + segment.data.len());
                segment_header.write_to(&mut buffer);
                buffer.extend_from_slice(&segment.data);

                if segment.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if !buffer.is_empty() {
            self.outbound.push_back(buffer.split().freeze());
        }
        self.buffer = buffer;

        let mss = self.mss as u32;
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(mss);
        }

        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = mss;
        }

        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = mss;
        }
    }

    /// Takes the next datagram the engine wants sent to the remote.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len() as u32;
        self.rcv_wnd.saturating_sub(used).min(u16::MAX as u32) as u16
    }

    fn update_ack(&mut self, rtt: i32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }

        let rto = self.rx_srtt + (self.interval as i32).max(4 * self.rx_rttval);
        self.rx_rto = (rto.max(0) as u32).clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(segment) => segment.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_una(&mut self, una: u32) {
        while self.snd_buf.front().is_some_and(|s| time_diff(una, s.sn) > 0) {
            self.snd_buf.pop_front();
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        if let Some(index) = self.snd_buf.iter().position(|s| s.sn == sn) {
            self.snd_buf.remove(index);
        }
    }

    fn parse_fast_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for segment in self.snd_buf.iter_mut() {
            if time_diff(sn, segment.sn) < 0 {
                break;
            } else if sn != segment.sn {
                segment.fast_ack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: Segment) {
        let sn = segment.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            return;
        }

        let mut insert_at = 0;
        for (index, existing) in self.rcv_buf.iter().enumerate().rev() {
            if existing.sn == sn {
                return;
            }

            if time_diff(sn, existing.sn) > 0 {
                insert_at = index + 1;
                break;
            }
        }

        self.rcv_buf.insert(insert_at, segment);
        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while self.rcv_queue.len() < self.rcv_wnd as usize && self.rcv_buf.front().is_some_and(|s| s.sn == self.rcv_nxt) {
            let Some(segment) = self.rcv_buf.pop_front() else {
                break;
            };

            self.rcv_queue.push_back(segment);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }
}

/// Pushes the buffered datagram out if `needed` more bytes would not fit in it.
fn make_room(buffer: &mut BytesMut, outbound: &mut VecDeque<Bytes>, mtu: usize, needed: usize) {
    if !buffer.is_empty() && buffer.len() + needed > mtu {
        outbound.push_back(buffer.split().freeze());
    }
}
