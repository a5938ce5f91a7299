//! Helper utils to apply a measured clock offset to the system clock
//!
//! Currently Unix based systems are supported

use chrono::{Duration, Local};

#[cfg(feature = "log")]
use log::debug;

use unix::sync_time;

mod unix;

/// Step the system clock by the given offset
///
/// A positive offset means the reference clock is ahead of this host, so
/// the local clock is moved forward by that amount. The adjustment is
/// carried out with the platform command line tool and silently truncates
/// to whole seconds.
pub fn apply_clock_delta(offset_micros: i64) {
    let corrected = Local::now() + Duration::microseconds(offset_micros);

    #[cfg(feature = "log")]
    debug!("stepping system clock by {} us", offset_micros);

    sync_time(corrected);
}
