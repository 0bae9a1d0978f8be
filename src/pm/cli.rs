use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;

use crate::pm::log::pm_event;
use crate::pm::{build_info, deputy};

/// The deputy id must be unique from other deputies. On startup, if another
/// deputy with the same id is detected, the newly started deputy
/// self-terminates (exit code 2).
#[derive(Debug, Parser)]
#[command(name = "deputy", version, about = "process supervisor deputy")]
pub struct Args {
    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Use deputy id NAME instead of the hostname
    #[arg(short = 'i', long = "id", value_name = "NAME")]
    pub id: Option<String>,

    /// Append log output to PATH instead of stderr
    #[arg(short = 'l', long = "log", value_name = "PATH")]
    pub log: Option<PathBuf>,

    /// Multicast URL for deputy messages
    #[arg(short = 'u', long = "lcmurl", value_name = "URL")]
    pub url: Option<String>,
}

/// Prepends the directory containing the deputy binary to PATH, so commands
/// installed next to the deputy resolve without an absolute path.
fn prepend_self_to_path() {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let Some(dir) = exe.parent() else {
        return;
    };
    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{path}", dir.display()));
}

/// Points stdout and stderr at an append-opened log file.
fn redirect_output(path: &Path) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("couldn't open logfile {}", path.display()))?;
    let fd = file.into_raw_fd();
    // SAFETY: replacing the standard output fds with the log file.
    unsafe {
        if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err).context("dup2 onto log file");
        }
        libc::close(fd);
    }
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut options = deputy::DeputyOptions::defaults();
    options.verbose = args.verbose;
    if let Some(id) = args.id {
        options.deputy_id = id;
    }
    if let Some(url) = args.url {
        options.transport_url = url;
    }

    prepend_self_to_path();
    if let Some(path) = &args.log {
        redirect_output(path)?;
    }

    pm_event("deputy", None, build_info::banner());
    pm_event("deputy", None, format!("deputy id: {}", options.deputy_id));

    let deputy = deputy::ProcmanDeputy::new(options)?;
    deputy.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_flags() {
        let args = Args::try_parse_from([
            "deputy", "-v", "-i", "robot03", "-u", "udpm://239.255.76.67:7667",
        ])
        .unwrap();
        assert!(args.verbose);
        assert_eq!(args.id.as_deref(), Some("robot03"));
        assert_eq!(args.url.as_deref(), Some("udpm://239.255.76.67:7667"));
        assert!(args.log.is_none());

        let args = Args::try_parse_from(["deputy", "--log", "/tmp/deputy.log"]).unwrap();
        assert_eq!(args.log.as_deref(), Some(Path::new("/tmp/deputy.log")));
    }
}
