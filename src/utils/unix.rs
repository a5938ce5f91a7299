use std::process::Command;

use chrono::{DateTime, Datelike, Local, Timelike};

/// Set the system time with the platform specific command line tool
pub(super) fn sync_time(time: DateTime<Local>) {
    let time_str = format!(
        "{}/{}/{} {:02}:{:02}:{:02}",
        time.month(),
        time.day(),
        time.year(),
        time.hour(),
        time.minute(),
        time.second()
    );

    match Command::new("date").args(["-s", time_str.as_str()]).status() {
        Ok(status) if !status.success() => {
            eprintln!("date command exit status {:?}", status.code());
        }
        Ok(_) => {}
        Err(err) => eprintln!("unable to execute date command: {err}"),
    }
}
