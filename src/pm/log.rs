use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Timestamped stderr line, tagged with the originating component and
/// optionally the command it concerns.
pub fn pm_event(component: &str, cmd: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match cmd {
        Some(c) => eprintln!("{ts} [{component}] cmd={c} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}

/// Same as `pm_event`, but only when the deputy runs with `--verbose`.
pub fn pm_debug(component: &str, cmd: Option<&str>, msg: impl AsRef<str>) {
    if verbose() {
        pm_event(component, cmd, msg);
    }
}
