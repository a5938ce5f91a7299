use core::mem::size_of;
use core::time::Duration;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::net::SocketAddr;

/// Microseconds in a second constant
pub(crate) const USEC_IN_SEC: u32 = 1_000_000;

/// Synchronization engine result type
pub type Result<T> = core::result::Result<T, Error>;

/// The error type for the synchronization engine
///
/// All variants are fatal to the tick that raised them; the owner of the
/// engine is expected to stop ticking once `step` fails. Recoverable
/// conditions (a stale reply id, a busy rejection) never surface here.
#[derive(Debug, PartialEq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A socket bind, send, receive or poll operation failed
    Network,
    /// Replay mode has been configured without a clock sink attached
    MissingClockSink,
    /// The delta journal could not be created or opened
    JournalInit,
    /// A record could not be appended to the delta journal
    JournalWrite,
    /// A journal record could not be read or carries a malformed payload
    JournalRead,
    /// The replay source has no more records
    ReplayExhausted,
}

/// Time exchange packet shared by requester and responder
///
/// All timestamps are microseconds since the UNIX epoch. `tc1`/`tc2` are
/// stamped by the requester (request send, reply receive), `ts1`/`ts2` by
/// the responder (request receive, reply send). `delay` is `0` on an
/// accepted reply; a positive value rejects the request and tells the
/// requester to retry no sooner than now + `delay`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SyncPacket {
    /// Correlation identifier chosen by the requester per request
    pub id: u32,
    /// Requester's request send timestamp
    pub tc1: i64,
    /// Responder's request receive timestamp
    pub ts1: i64,
    /// Responder's reply send timestamp
    pub ts2: i64,
    /// Requester's reply receive timestamp
    pub tc2: i64,
    /// Retry backoff in microseconds, `0` on an accepted reply
    pub delay: i64,
}

impl SyncPacket {
    /// Encoded size of a packet on the wire
    pub const WIRE_SIZE: usize = 44;

    /// Estimate the clock offset of the responder relative to the requester.
    ///
    /// With `d` the one-way network delay and `to` the offset to estimate,
    ///    `ts1 - tc1 = d + to + R(Ts)`
    ///    `tc2 - ts2 = d - to + R(Tc)`
    /// where `R(Ts)` and `R(Tc)` are the cycle-time dependent delay
    /// components on either side. Subtracting and halving cancels `d`:
    ///    `[(ts1 - tc1) - (tc2 - ts2)] / 2 = to`
    /// under the assumption that both paths see comparable delay. The
    /// division truncates toward zero.
    #[must_use]
    pub fn offset(&self) -> i64 {
        ((self.ts1 - self.tc1) - (self.tc2 - self.ts2)) / 2
    }
}

/// Wire image of a [`SyncPacket`]
///
/// The wire layout is a fixed contract independent of the struct's field
/// order: `id` (4 bytes) followed by `tc1, ts1, tc2, ts2` and `delay`
/// (8 bytes each), all little-endian, 44 bytes total, no padding.
#[derive(Copy, Clone)]
pub struct RawSyncPacket(pub [u8; SyncPacket::WIRE_SIZE]);

impl Default for RawSyncPacket {
    fn default() -> Self {
        RawSyncPacket([0u8; SyncPacket::WIRE_SIZE])
    }
}

impl From<RawSyncPacket> for SyncPacket {
    fn from(val: RawSyncPacket) -> Self {
        let to_array_u32 = |x: &[u8]| {
            let mut temp_buf = [0u8; size_of::<u32>()];
            temp_buf.copy_from_slice(x);
            temp_buf
        };
        let to_array_i64 = |x: &[u8]| {
            let mut temp_buf = [0u8; size_of::<i64>()];
            temp_buf.copy_from_slice(x);
            temp_buf
        };

        SyncPacket {
            id: u32::from_le_bytes(to_array_u32(&val.0[0..4])),
            tc1: i64::from_le_bytes(to_array_i64(&val.0[4..12])),
            ts1: i64::from_le_bytes(to_array_i64(&val.0[12..20])),
            tc2: i64::from_le_bytes(to_array_i64(&val.0[20..28])),
            ts2: i64::from_le_bytes(to_array_i64(&val.0[28..36])),
            delay: i64::from_le_bytes(to_array_i64(&val.0[36..44])),
        }
    }
}

impl From<&SyncPacket> for RawSyncPacket {
    fn from(val: &SyncPacket) -> Self {
        let mut tmp_buf = [0u8; SyncPacket::WIRE_SIZE];

        tmp_buf[0..4].copy_from_slice(&val.id.to_le_bytes());
        tmp_buf[4..12].copy_from_slice(&val.tc1.to_le_bytes());
        tmp_buf[12..20].copy_from_slice(&val.ts1.to_le_bytes());
        tmp_buf[20..28].copy_from_slice(&val.tc2.to_le_bytes());
        tmp_buf[28..36].copy_from_slice(&val.ts2.to_le_bytes());
        tmp_buf[36..44].copy_from_slice(&val.delay.to_le_bytes());

        RawSyncPacket(tmp_buf)
    }
}

/// A computed clock offset sample
///
/// Produced at most once per completed exchange and delivered to the
/// [`ClockSink`]. The same pair is what the delta journal stores; the
/// payload helpers define the journal encoding of the offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClockDelta {
    /// Local timestamp the offset was measured at, microseconds since epoch
    pub timestamp: i64,
    /// Estimated offset of the reference clock, microseconds
    pub offset: i64,
}

impl ClockDelta {
    /// Journal payload encoding of the offset
    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        self.offset.to_le_bytes()
    }

    /// Rebuild a sample from a journal record
    ///
    /// # Errors
    ///
    /// Will return `Err` if the payload is not an 8-byte offset record
    pub fn from_payload(timestamp: i64, payload: &[u8]) -> Result<Self> {
        let Ok(raw) = <[u8; 8]>::try_from(payload) else {
            return Err(Error::JournalRead);
        };

        Ok(ClockDelta {
            timestamp,
            offset: i64::from_le_bytes(raw),
        })
    }
}

/// Engine state, one of which is consumed per tick
///
/// The requester cycles `Transmit -> AwaitReply -> Fix -> Sleep ->
/// Transmit`; the responder cycles `Receive -> Reply -> Receive`. The role
/// chosen at construction fixes which subset is reachable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Issue a time synchronization request with a fresh id
    Transmit,
    /// Poll for the reply to the outstanding request
    AwaitReply,
    /// Compute the offset and deliver it to the clock sink
    Fix,
    /// Idle until the next resynchronization is due
    Sleep,
    /// Poll for an inbound synchronization request
    Receive,
    /// Reply to the request taken in service
    Reply,
}

/// Engine configuration, read once at construction
///
/// An absent `server` address selects the responder role; `replay` takes
/// precedence over both live roles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Emit the chattier info-level messages during operation
    pub verbose: bool,
    /// Reference peer to synchronize against; `None` makes this peer the
    /// reference responder
    pub server: Option<SocketAddr>,
    /// Resynchronization period in seconds; also the unit of contention
    /// backoff handed to colliding requesters
    pub adjust_interval: u32,
    /// Poll timeouts tolerated per request before it is abandoned and
    /// reissued with a fresh id
    pub max_wait_count: u32,
    /// Feed previously recorded offsets to the sink instead of exchanging
    /// packets
    pub replay: bool,
    /// Delta journal path. Required for replay; in live mode the measured
    /// offsets are persisted here whenever both a server and a sink are
    /// configured
    pub journal: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            verbose: false,
            server: None,
            adjust_interval: 10,
            max_wait_count: 1000,
            replay: false,
            journal: None,
        }
    }
}

/// A trait encapsulating timestamp generator's operations
///
/// The engine stamps every packet and deadline through this seam, so tests
/// and platforms without a usable `SystemTime` can provide their own time
/// source. `init` is called every time before the two accessors, which must
/// then report the same instant.
pub trait TimestampGenerator {
    /// Capture `now`; expected before each `timestamp_sec` /
    /// `timestamp_subsec_micros` pair
    fn init(&mut self);

    /// Seconds since UNIX epoch of the captured instant
    fn timestamp_sec(&self) -> u64;

    /// Fractional part of the captured instant in whole microseconds
    fn timestamp_subsec_micros(&self) -> u32;
}

/// Standard library timestamp generator that relies on `std::time`
#[derive(Copy, Clone, Default)]
pub struct StdTimestampGen {
    duration: Duration,
}

impl TimestampGenerator for StdTimestampGen {
    fn init(&mut self) {
        self.duration = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap();
    }

    fn timestamp_sec(&self) -> u64 {
        self.duration.as_secs()
    }

    fn timestamp_subsec_micros(&self) -> u32 {
        self.duration.subsec_micros()
    }
}

/// A trait encapsulating the UDP socket interface required by the engine
///
/// All operations are synchronous and must not block beyond the given
/// bounds: `send_to`/`recv_from` operate on datagrams already writable or
/// readable, and `poll_readable` waits at most `timeout` for one to arrive.
pub trait SyncUdpSocket {
    /// Send the given buffer to the address provided. On success, returns
    /// the number of bytes written.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an underlying UDP send fails
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;

    /// Receive a single datagram. On success, returns the number of bytes
    /// read and the origin. The caller provides a buffer large enough for a
    /// full packet.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an underlying UDP receive fails
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Report whether a datagram is ready to be received, waiting at most
    /// `timeout`. A zero timeout is a pure readiness check and must not
    /// wait at all.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the readiness query itself fails
    fn poll_readable(&self, timeout: Duration) -> Result<bool>;
}

/// Receiving endpoint for computed clock offsets
///
/// Called at most once per completed exchange (or once per replay tick).
pub trait ClockSink {
    /// Accept the offset measured at `timestamp`, both in microseconds
    fn set_delta(&mut self, timestamp: i64, offset: i64);
}
