//! Peer-to-peer UDP clock synchronization engine
//!
//! # Overview
//!
//! This crate estimates the clock offset between two networked peers with a
//! best-effort datagram exchange and periodically re-synchronizes to track
//! drift. One peer acts as the reference (the responder); the other (the
//! requester) issues a timed request and derives its offset from the four
//! round-trip timestamps. The exchange is driven by a compact state
//! machine: the requester cycles transmit, await, fix and sleep, the
//! responder cycles receive and reply, and colliding requesters are turned
//! away with staggered retry delays instead of being queued.
//!
//! The engine is single-threaded and step-driven: every call to
//! [`SyncEngine::step`] performs exactly one state transition and never
//! blocks beyond a short bounded poll. The caller owns the loop, which
//! makes the engine embeddable in cooperative schedulers and trivially
//! testable.
//!
//! ## Features
//!
//! - `std-socket`: [`SyncUdpSocket`] trait implementation for
//!   `std::net::UdpSocket`
//! - `log`: enables library debug output during execution
//! - `utils`: OS specific helpers to apply a measured offset to the system
//!   clock
//!
//! # Details
//!
//! Network I/O, timestamping and offset delivery all go through traits
//! ([`SyncUdpSocket`], [`TimestampGenerator`], [`ClockSink`]) so the engine
//! can be wired to custom stacks and exercised without real sockets.
//! Completed measurements can be persisted to a [`DeltaJournal`] and played
//! back later in replay mode, which feeds the recorded offsets to the sink
//! without generating any traffic.
//!
//! # Example
//!
//! ```no_run
//! use utsync::{ClockSink, StdTimestampGen, SyncConfig, SyncEngine};
//! use std::net::UdpSocket;
//!
//! struct PrintSink;
//!
//! impl ClockSink for PrintSink {
//!     fn set_delta(&mut self, timestamp: i64, offset: i64) {
//!         println!("{timestamp}: offset {offset} us");
//!     }
//! }
//!
//! let socket = UdpSocket::bind("0.0.0.0:2357")
//!     .expect("Unable to create UDP socket");
//! let config = SyncConfig {
//!     server: Some("192.0.2.10:2357".parse().unwrap()),
//!     adjust_interval: 10,
//!     journal: Some("deltas.journal".into()),
//!     ..SyncConfig::default()
//! };
//! let mut engine = SyncEngine::new(
//!     config,
//!     socket,
//!     StdTimestampGen::default(),
//!     Some(PrintSink),
//! )
//! .expect("Unable to set up the engine");
//!
//! loop {
//!     if let Err(err) = engine.step() {
//!         eprintln!("engine failure: {err:?}");
//!         break;
//!     }
//! }
//! ```

#[cfg(all(feature = "utils", unix))]
pub mod utils;

mod journal;
mod socket;
mod types;

pub use crate::journal::DeltaJournal;
pub use crate::types::*;

use core::time::Duration;

#[cfg(feature = "log")]
use log::{debug, error, info};

/// Network types used by the `utsync` crate
pub mod net {
    pub use core::net::SocketAddr;

    #[cfg(feature = "std-socket")]
    pub use std::net::UdpSocket;
}

use crate::net::SocketAddr;
use core::net::{IpAddr, Ipv4Addr};

/// Bounded wait applied to each reply/request poll inside one tick
const POLL_WINDOW: Duration = Duration::from_millis(10);

/// Role of this peer, fixed for the lifetime of the engine
#[derive(Debug, Copy, Clone)]
enum Role {
    Requester { server: SocketAddr },
    Responder,
    Replay,
}

/// The synchronization engine
///
/// Owns the transport, the timestamp generator and an optional clock sink.
/// Construction decides the role once: a configured server address makes
/// this peer a requester, its absence makes it the responder, and the
/// replay flag bypasses the exchange entirely in favor of the recorded
/// journal. One [`step`](SyncEngine::step) performs one state transition;
/// the caller must serialize the calls.
pub struct SyncEngine<U, T, S> {
    socket: U,
    timestamp_gen: T,
    sink: Option<S>,
    journal: Option<DeltaJournal>,
    role: Role,
    state: SyncState,
    pending: SyncPacket,
    peer: SocketAddr,
    wait_count: u32,
    next_adjust: i64,
    adjust_interval: u32,
    max_wait_count: u32,
    verbose: bool,
}

impl<U, T, S> SyncEngine<U, T, S>
where
    U: SyncUdpSocket,
    T: TimestampGenerator,
    S: ClockSink,
{
    /// Set up an engine from the given configuration
    ///
    /// The socket arrives already bound; address resolution and socket
    /// options stay with the caller. Pass `None` for the sink to only log
    /// measured offsets.
    ///
    /// # Errors
    ///
    /// Will return `Err` when replay mode lacks a sink, or when a required
    /// delta journal cannot be set up: replaying always needs one, and a
    /// live requester persists through one whenever a sink is attached
    pub fn new(
        config: SyncConfig,
        socket: U,
        timestamp_gen: T,
        sink: Option<S>,
    ) -> Result<Self> {
        let journal = if config.replay {
            if sink.is_none() {
                return Err(Error::MissingClockSink);
            }
            let path = config.journal.as_ref().ok_or(Error::JournalInit)?;
            Some(DeltaJournal::open(path)?)
        } else if config.server.is_some() && sink.is_some() {
            let path = config.journal.as_ref().ok_or(Error::JournalInit)?;
            Some(DeltaJournal::create(path)?)
        } else {
            None
        };

        let (role, state) = if config.replay {
            (Role::Replay, SyncState::Sleep)
        } else {
            match config.server {
                Some(server) => {
                    (Role::Requester { server }, SyncState::Transmit)
                }
                None => (Role::Responder, SyncState::Receive),
            }
        };

        Ok(SyncEngine {
            socket,
            timestamp_gen,
            sink,
            journal,
            role,
            state,
            pending: SyncPacket::default(),
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            wait_count: 0,
            next_adjust: 0,
            adjust_interval: config.adjust_interval,
            max_wait_count: config.max_wait_count,
            verbose: config.verbose,
        })
    }

    /// Current engine state
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Perform one processing tick
    ///
    /// Exactly one state transition (or one replay delivery) happens per
    /// call. Recoverable protocol conditions are handled internally; an
    /// `Err` is fatal and the owner should stop ticking.
    ///
    /// # Errors
    ///
    /// Will return `Err` on a transport failure, on a journal write
    /// failure while fixing, and in replay mode once the source is
    /// exhausted or unreadable
    pub fn step(&mut self) -> Result<()> {
        match self.role {
            Role::Replay => self.replay_step(),
            Role::Requester { server } => match self.state {
                SyncState::Transmit => self.transmit(server),
                SyncState::AwaitReply => self.await_reply(),
                SyncState::Fix => self.fix(),
                SyncState::Sleep => self.sleep(),
                // the requester role never enters the responder states
                SyncState::Receive | SyncState::Reply => Ok(()),
            },
            Role::Responder => match self.state {
                SyncState::Receive => self.receive(),
                SyncState::Reply => self.reply(),
                // the responder role never enters the requester states
                _ => Ok(()),
            },
        }
    }

    /// Release the transport and close the journal
    pub fn shutdown(self) {}

    /// Issue a synchronization request with a fresh correlation id
    fn transmit(&mut self, server: SocketAddr) -> Result<()> {
        self.pending = SyncPacket {
            id: rand::random(),
            tc1: self.now(),
            ..SyncPacket::default()
        };

        #[cfg(feature = "log")]
        debug!(
            "sending request id {} tc1 {} to {}",
            self.pending.id, self.pending.tc1, server
        );

        let raw = RawSyncPacket::from(&self.pending);
        self.send(&raw.0, server)?;
        self.wait_count = 0;
        self.state = SyncState::AwaitReply;

        Ok(())
    }

    /// Wait for the reply to the outstanding request
    ///
    /// Consumes every datagram that arrives within the poll window. A
    /// reply carrying a foreign id is dropped and counted; it belongs to
    /// an earlier, already abandoned request round. The wait-attempt
    /// budget is only spent by empty polls.
    fn await_reply(&mut self) -> Result<()> {
        let mut mismatches = 0u32;

        loop {
            if !self.socket.poll_readable(POLL_WINDOW)? {
                // poll expired with nothing queued
                if self.wait_count < self.max_wait_count {
                    self.wait_count += 1;
                } else {
                    self.state = SyncState::Transmit;
                }
                return Ok(());
            }

            let mut raw = RawSyncPacket::default();
            let (len, _) = self.socket.recv_from(raw.0.as_mut())?;
            if len != SyncPacket::WIRE_SIZE {
                mismatches += 1;
                #[cfg(feature = "log")]
                error!("dropped undersized datagram of {len} bytes");
                continue;
            }

            let reply = SyncPacket::from(raw);
            if reply.id != self.pending.id {
                mismatches += 1;
                #[cfg(feature = "log")]
                error!(
                    "reply id {} does not match request id {}",
                    reply.id, self.pending.id
                );
                continue;
            }

            if reply.delay != 0 {
                // busy rejection; the responder picked our retry slot
                self.next_adjust = self.now() + reply.delay;
                self.state = SyncState::Sleep;
                if self.verbose {
                    #[cfg(feature = "log")]
                    info!(
                        "request id {} denied, retrying at {}",
                        reply.id, self.next_adjust
                    );
                }
            } else {
                self.pending.ts1 = reply.ts1;
                self.pending.ts2 = reply.ts2;
                self.pending.tc2 = self.now();
                // A disturbed round is not worth fixing on; start over
                // with a fresh id instead
                self.state = if mismatches == 0 {
                    SyncState::Fix
                } else {
                    SyncState::Transmit
                };
            }

            return Ok(());
        }
    }

    /// Take one inbound request in service, then turn away the rest
    fn receive(&mut self) -> Result<()> {
        if self.socket.poll_readable(POLL_WINDOW)? {
            let mut raw = RawSyncPacket::default();
            let (len, src) = self.socket.recv_from(raw.0.as_mut())?;
            if len == SyncPacket::WIRE_SIZE {
                self.pending = SyncPacket::from(raw);
                self.pending.ts1 = self.now();
                self.peer = src;
                self.state = SyncState::Reply;

                #[cfg(feature = "log")]
                debug!(
                    "request id {} received from {src}, ts1 {}",
                    self.pending.id, self.pending.ts1
                );
            } else {
                #[cfg(feature = "log")]
                error!("dropped undersized datagram of {len} bytes from {src}");
            }
        }

        self.drain_backlog()
    }

    /// Reply to the request taken in service in the previous tick
    fn reply(&mut self) -> Result<()> {
        self.pending.ts2 = self.now();
        self.pending.delay = 0;

        if self.verbose {
            #[cfg(feature = "log")]
            info!(
                "replying to request id {} at {}",
                self.pending.id, self.pending.ts2
            );
        }

        let raw = RawSyncPacket::from(&self.pending);
        self.send(&raw.0, self.peer)?;
        self.state = SyncState::Receive;

        self.drain_backlog()
    }

    /// Reject every request queued behind the one in service
    ///
    /// Each rejection carries a later retry slot so colliding requesters
    /// come back staggered instead of all at once. The sweep never waits:
    /// it ends the moment no more datagrams are immediately queued.
    fn drain_backlog(&mut self) -> Result<()> {
        let interval = self.adjust_interval_micros();
        let mut backoff = interval;

        while self.socket.poll_readable(Duration::ZERO)? {
            let mut raw = RawSyncPacket::default();
            let (len, src) = self.socket.recv_from(raw.0.as_mut())?;
            if len != SyncPacket::WIRE_SIZE {
                #[cfg(feature = "log")]
                error!("dropped undersized datagram of {len} bytes from {src}");
                continue;
            }

            let mut rejected = SyncPacket::from(raw);
            rejected.delay = backoff;

            #[cfg(feature = "log")]
            debug!(
                "rejecting request id {} with retry delay {}",
                rejected.id, rejected.delay
            );

            let raw = RawSyncPacket::from(&rejected);
            self.send(&raw.0, src)?;
            backoff += interval;
        }

        Ok(())
    }

    /// Compute the offset from the completed exchange and deliver it
    fn fix(&mut self) -> Result<()> {
        let now = self.now();
        let delta = ClockDelta {
            timestamp: now,
            offset: self.pending.offset(),
        };

        if let Some(sink) = self.sink.as_mut() {
            sink.set_delta(delta.timestamp, delta.offset);
            if let Some(journal) = self.journal.as_mut() {
                journal.write(delta.timestamp, &delta.to_payload())?;
            }
        } else {
            #[cfg(feature = "log")]
            info!("measured clock offset {} us", delta.offset);
        }

        self.next_adjust = now + self.adjust_interval_micros();
        self.state = SyncState::Sleep;

        if self.verbose {
            #[cfg(feature = "log")]
            info!(
                "offset fixed for id {}, next request at {}",
                self.pending.id, self.next_adjust
            );
        }

        Ok(())
    }

    /// Idle until the next resynchronization is due
    fn sleep(&mut self) -> Result<()> {
        if self.now() >= self.next_adjust {
            self.state = SyncState::Transmit;

            if self.verbose {
                #[cfg(feature = "log")]
                info!("resynchronization due, moving to transmit");
            }
        }

        Ok(())
    }

    /// Deliver one recorded sample to the sink
    fn replay_step(&mut self) -> Result<()> {
        // Construction guarantees replay always has a journal and a sink
        let journal = self.journal.as_mut().ok_or(Error::JournalRead)?;
        let (timestamp, payload) = journal.read()?;
        let delta = ClockDelta::from_payload(timestamp, &payload)?;

        match self.sink.as_mut() {
            Some(sink) => {
                sink.set_delta(delta.timestamp, delta.offset);
                Ok(())
            }
            None => Err(Error::MissingClockSink),
        }
    }

    fn send(&self, buf: &[u8], dest: SocketAddr) -> Result<()> {
        let sent = self.socket.send_to(buf, dest)?;
        if sent == buf.len() {
            Ok(())
        } else {
            Err(Error::Network)
        }
    }

    fn now(&mut self) -> i64 {
        self.timestamp_gen.init();
        unix_timestamp_micros(&self.timestamp_gen)
    }

    fn adjust_interval_micros(&self) -> i64 {
        i64::from(self.adjust_interval) * i64::from(USEC_IN_SEC)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn unix_timestamp_micros<T: TimestampGenerator>(timestamp_gen: &T) -> i64 {
    timestamp_gen.timestamp_sec() as i64 * i64::from(USEC_IN_SEC)
        + i64::from(timestamp_gen.timestamp_subsec_micros())
}

#[cfg(test)]
mod utsync_engine_tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::rc::Rc;

    const INTERVAL_SECS: u32 = 10;
    const INTERVAL_MICROS: i64 = 10_000_000;
    const START: i64 = 1_000_000_000_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn journal_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("utsync-{}-{}.journal", name, std::process::id()))
    }

    fn decode(bytes: &[u8]) -> SyncPacket {
        let mut raw = RawSyncPacket::default();
        raw.0.copy_from_slice(bytes);
        SyncPacket::from(raw)
    }

    #[derive(Default)]
    struct ScriptedSocket {
        inbound: RefCell<VecDeque<(Vec<u8>, SocketAddr)>>,
        outbound: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
        fail_poll: Cell<bool>,
    }

    impl ScriptedSocket {
        fn push(&self, packet: &SyncPacket, src: SocketAddr) {
            let raw = RawSyncPacket::from(packet);
            self.inbound.borrow_mut().push_back((raw.0.to_vec(), src));
        }

        fn sent(&self, index: usize) -> (SyncPacket, SocketAddr) {
            let outbound = self.outbound.borrow();
            let (bytes, dest) = &outbound[index];
            (decode(bytes), *dest)
        }

        fn sent_count(&self) -> usize {
            self.outbound.borrow().len()
        }
    }

    impl SyncUdpSocket for Rc<ScriptedSocket> {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
            self.outbound.borrow_mut().push((buf.to_vec(), addr));
            Ok(buf.len())
        }

        fn recv_from(
            &self,
            buf: &mut [u8],
        ) -> Result<(usize, SocketAddr)> {
            let (bytes, src) = self
                .inbound
                .borrow_mut()
                .pop_front()
                .ok_or(Error::Network)?;
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok((bytes.len(), src))
        }

        fn poll_readable(&self, _timeout: Duration) -> Result<bool> {
            if self.fail_poll.get() {
                return Err(Error::Network);
            }
            Ok(!self.inbound.borrow().is_empty())
        }
    }

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<i64>>);

    impl ManualClock {
        fn set(&self, micros: i64) {
            self.0.set(micros);
        }

        fn advance(&self, micros: i64) {
            self.0.set(self.0.get() + micros);
        }
    }

    impl TimestampGenerator for ManualClock {
        fn init(&mut self) {}

        fn timestamp_sec(&self) -> u64 {
            (self.0.get() / i64::from(USEC_IN_SEC)) as u64
        }

        fn timestamp_subsec_micros(&self) -> u32 {
            (self.0.get() % i64::from(USEC_IN_SEC)) as u32
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Vec<(i64, i64)>>>);

    impl RecordingSink {
        fn deltas(&self) -> Vec<(i64, i64)> {
            self.0.borrow().clone()
        }
    }

    impl ClockSink for RecordingSink {
        fn set_delta(&mut self, timestamp: i64, offset: i64) {
            self.0.borrow_mut().push((timestamp, offset));
        }
    }

    type TestEngine = SyncEngine<Rc<ScriptedSocket>, ManualClock, RecordingSink>;

    fn requester(
        name: &str,
        max_wait_count: u32,
    ) -> (TestEngine, Rc<ScriptedSocket>, ManualClock, RecordingSink) {
        let socket = Rc::new(ScriptedSocket::default());
        let clock = ManualClock::default();
        clock.set(START);
        let sink = RecordingSink::default();
        let config = SyncConfig {
            server: Some(addr(2357)),
            adjust_interval: INTERVAL_SECS,
            max_wait_count,
            journal: Some(journal_path(name)),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            config,
            Rc::clone(&socket),
            clock.clone(),
            Some(sink.clone()),
        )
        .unwrap();

        (engine, socket, clock, sink)
    }

    fn responder() -> (TestEngine, Rc<ScriptedSocket>, ManualClock) {
        let socket = Rc::new(ScriptedSocket::default());
        let clock = ManualClock::default();
        clock.set(START);
        let config = SyncConfig {
            adjust_interval: INTERVAL_SECS,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            config,
            Rc::clone(&socket),
            clock.clone(),
            None::<RecordingSink>,
        )
        .unwrap();

        (engine, socket, clock)
    }

    #[test]
    fn test_full_exchange() {
        let (mut engine, socket, clock, sink) =
            requester("full-exchange", 5);

        assert_eq!(engine.state(), SyncState::Transmit);
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::AwaitReply);

        let (request, dest) = socket.sent(0);
        assert_eq!(dest, addr(2357));
        assert_eq!(request.tc1, START);
        assert_eq!(request.delay, 0);

        // responder clock runs 60 us ahead on average in this script:
        // ts1 - tc1 = 300, tc2 - ts2 = 180 -> offset 60
        let reply = SyncPacket {
            ts1: request.tc1 + 300,
            ts2: request.tc1 + 320,
            ..request
        };
        clock.advance(500);
        socket.push(&reply, addr(2357));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Fix);

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Sleep);
        assert_eq!(sink.deltas(), vec![(START + 500, 60)]);

        // not due yet
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Sleep);
        assert_eq!(socket.sent_count(), 1);

        clock.advance(INTERVAL_MICROS);
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Transmit);

        engine.step().unwrap();
        assert_eq!(socket.sent_count(), 2);
        let (second, _) = socket.sent(1);
        assert_ne!(second.id, request.id);
        assert_eq!(sink.deltas().len(), 1);
    }

    #[test]
    fn test_responder_exchange() {
        let (mut engine, socket, clock) = responder();

        let request = SyncPacket {
            id: 11,
            tc1: 777,
            ..SyncPacket::default()
        };
        socket.push(&request, addr(4001));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Reply);

        clock.advance(700);
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Receive);

        let (reply, dest) = socket.sent(0);
        assert_eq!(dest, addr(4001));
        assert_eq!(reply.id, 11);
        assert_eq!(reply.tc1, 777);
        assert_eq!(reply.ts1, START);
        assert_eq!(reply.ts2, START + 700);
        assert_eq!(reply.delay, 0);
    }

    #[test]
    fn test_collision_backoff() {
        let (mut engine, socket, _clock) = responder();

        for (id, port) in [(11u32, 4001u16), (22, 4002), (33, 4003)] {
            let request = SyncPacket {
                id,
                tc1: 777,
                ..SyncPacket::default()
            };
            socket.push(&request, addr(port));
        }

        // first request goes in service; the queued two are rejected with
        // strictly increasing retry delays, in arrival order
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Reply);
        assert_eq!(socket.sent_count(), 2);

        let (first_reject, first_dest) = socket.sent(0);
        assert_eq!(first_dest, addr(4002));
        assert_eq!(first_reject.id, 22);
        assert_eq!(first_reject.delay, INTERVAL_MICROS);

        let (second_reject, second_dest) = socket.sent(1);
        assert_eq!(second_dest, addr(4003));
        assert_eq!(second_reject.id, 33);
        assert_eq!(second_reject.delay, 2 * INTERVAL_MICROS);

        // the serviced request still gets its healthy reply
        engine.step().unwrap();
        let (reply, dest) = socket.sent(2);
        assert_eq!(dest, addr(4001));
        assert_eq!(reply.id, 11);
        assert_eq!(reply.delay, 0);
    }

    #[test]
    fn test_foreign_reply_rejection() {
        let (mut engine, socket, _clock, sink) = requester("foreign", 3);

        engine.step().unwrap();
        let (request, _) = socket.sent(0);

        let foreign = SyncPacket {
            id: request.id ^ 1,
            ..request
        };
        socket.push(&foreign, addr(2357));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::AwaitReply);
        assert_eq!(engine.wait_count, 1);
        assert!(sink.deltas().is_empty());

        // a mismatch in an earlier wait cycle does not taint this one
        let reply = SyncPacket {
            ts1: request.tc1 + 10,
            ts2: request.tc1 + 12,
            ..request
        };
        socket.push(&reply, addr(2357));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Fix);
    }

    #[test]
    fn test_disturbed_round_discarded() {
        let (mut engine, socket, _clock, sink) = requester("disturbed", 3);

        engine.step().unwrap();
        let (request, _) = socket.sent(0);

        let foreign = SyncPacket {
            id: request.id ^ 1,
            ..request
        };
        let reply = SyncPacket {
            ts1: request.tc1 + 10,
            ts2: request.tc1 + 12,
            ..request
        };
        socket.push(&foreign, addr(2357));
        socket.push(&reply, addr(2357));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Transmit);
        assert!(sink.deltas().is_empty());
    }

    #[test]
    fn test_timeout_exhaustion() {
        let (mut engine, socket, _clock, _sink) = requester("timeout", 2);

        engine.step().unwrap();
        let (request, _) = socket.sent(0);

        for expected_wait in [1, 2] {
            engine.step().unwrap();
            assert_eq!(engine.state(), SyncState::AwaitReply);
            assert_eq!(engine.wait_count, expected_wait);
        }

        // budget spent; the request is abandoned
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Transmit);
        assert_eq!(socket.sent_count(), 1);

        engine.step().unwrap();
        assert_eq!(socket.sent_count(), 2);
        assert_eq!(engine.wait_count, 0);
        let (second, _) = socket.sent(1);
        assert_ne!(second.id, request.id);
    }

    #[test]
    fn test_busy_rejection() {
        let (mut engine, socket, clock, sink) = requester("busy", 3);

        engine.step().unwrap();
        let (request, _) = socket.sent(0);

        let denial = SyncPacket {
            delay: 5_000_000,
            ..request
        };
        socket.push(&denial, addr(2357));

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Sleep);
        assert_eq!(engine.next_adjust, START + 5_000_000);
        assert!(sink.deltas().is_empty());

        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Sleep);

        clock.advance(5_000_000);
        engine.step().unwrap();
        assert_eq!(engine.state(), SyncState::Transmit);
    }

    #[test]
    fn test_replay_fidelity() {
        let path = journal_path("replay");
        let recorded = [(100i64, 5i64), (200, -7), (300, 0)];

        let mut journal = DeltaJournal::create(&path).unwrap();
        for (timestamp, offset) in recorded {
            let delta = ClockDelta { timestamp, offset };
            journal.write(timestamp, &delta.to_payload()).unwrap();
        }
        drop(journal);

        let socket = Rc::new(ScriptedSocket::default());
        let sink = RecordingSink::default();
        let config = SyncConfig {
            replay: true,
            journal: Some(path.clone()),
            ..SyncConfig::default()
        };
        let mut engine = SyncEngine::new(
            config,
            Rc::clone(&socket),
            ManualClock::default(),
            Some(sink.clone()),
        )
        .unwrap();

        for _ in recorded {
            engine.step().unwrap();
        }

        assert_eq!(sink.deltas(), recorded.to_vec());
        assert_eq!(socket.sent_count(), 0);
        assert_eq!(engine.step(), Err(Error::ReplayExhausted));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_replay_requires_sink() {
        let config = SyncConfig {
            replay: true,
            journal: Some(journal_path("no-sink")),
            ..SyncConfig::default()
        };
        let result = SyncEngine::new(
            config,
            Rc::new(ScriptedSocket::default()),
            ManualClock::default(),
            None::<RecordingSink>,
        );

        assert!(matches!(result, Err(Error::MissingClockSink)));
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let (mut engine, socket, _clock, _sink) = requester("fatal", 3);

        engine.step().unwrap();
        socket.fail_poll.set(true);

        assert_eq!(engine.step(), Err(Error::Network));
    }
}
