//! Runnable requester/responder pair built on the `utsync` engine
//!
//! Start the reference responder first:
//!
//! ```
//! cargo run -- --port 2357
//! ```
//!
//! Then point a requester at it from another host or terminal:
//!
//! ```
//! cargo run -- --server 127.0.0.1:2357 --interval 5
//! ```
//!
//! The requester prints one offset sample per completed exchange and
//! records it to the journal; `--replay` plays a recorded journal back
//! without touching the network.

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;

use clap::Parser;
use utsync::{ClockSink, StdTimestampGen, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "timesync")]
#[command(version)]
struct Cli {
    /// Local UDP port to bind
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Reference peer address; omit to run as the responder
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Resynchronization interval in seconds
    #[arg(short, long, default_value = "10")]
    interval: u32,

    /// Journal of measured offsets
    #[arg(short, long, default_value = "timesync.journal")]
    journal: PathBuf,

    /// Play the journal back instead of exchanging packets
    #[arg(long)]
    replay: bool,
}

struct PrintSink;

impl ClockSink for PrintSink {
    fn set_delta(&mut self, timestamp: i64, offset: i64) {
        println!("{timestamp}: clock offset {offset} us");
    }
}

fn main() {
    simple_logger::init_with_level(log::Level::Debug).unwrap();
    let cli = Cli::parse();

    let socket = UdpSocket::bind(("0.0.0.0", cli.port))
        .expect("Unable to create UDP socket");
    let sink = (cli.server.is_some() || cli.replay).then_some(PrintSink);
    let config = SyncConfig {
        verbose: true,
        server: cli.server,
        adjust_interval: cli.interval,
        replay: cli.replay,
        journal: Some(cli.journal),
        ..SyncConfig::default()
    };

    let mut engine =
        SyncEngine::new(config, socket, StdTimestampGen::default(), sink)
            .expect("Unable to set up the sync engine");

    loop {
        if let Err(err) = engine.step() {
            eprintln!("engine failure: {err:?}");
            break;
        }
    }

    engine.shutdown();
}
