//! Process and system resource counters read from `/proc`.
//!
//! Everything here degrades gracefully off Linux: readers return zeroed
//! structs, descendant enumeration returns nothing, and the orphan test is
//! always false. The deputy then simply reports zeros.

use anyhow::Context as _;

/// Per-process CPU and memory counters, one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    /// User-mode jiffies.
    pub user: u64,
    /// Kernel-mode jiffies.
    pub system: u64,
    /// Virtual memory size in bytes.
    pub vsize: u64,
    /// Resident set size in bytes.
    pub rss: u64,
    pub shared: u64,
    pub text: u64,
    pub data: u64,
}

/// System-wide CPU and memory counters, one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub user: u64,
    pub user_low: u64,
    pub system: u64,
    pub idle: u64,
    pub memtotal: u64,
    pub memfree: u64,
    pub swaptotal: u64,
    pub swapfree: u64,
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Fields of `/proc/<pid>/stat` the deputy cares about.
#[derive(Debug, Clone, Copy, Default)]
struct PidStat {
    ppid: i32,
    pgrp: i32,
    session: i32,
    /// utime / stime in jiffies.
    utime: u64,
    stime: u64,
    /// vsize in bytes, rss in pages.
    vsize: u64,
    rss_pages: u64,
}

/// Parses one `/proc/<pid>/stat` line.
///
/// The comm field (2) is parenthesised and may contain spaces, so the line
/// is split after the last `)` and the remaining whitespace-separated fields
/// are numbered from 3.
fn parse_pid_stat(line: &str) -> Option<PidStat> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); stat field N lives at fields[N - 3].
    Some(PidStat {
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
        session: fields.get(3)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        vsize: fields.get(20)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Parses `/proc/<pid>/statm` (values in pages).
fn parse_statm(content: &str) -> Option<(u64, u64, u64)> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    let shared = fields.get(2)?.parse().ok()?;
    let text = fields.get(3)?.parse().ok()?;
    let data = fields.get(5)?.parse().ok()?;
    Some((shared, text, data))
}

/// Parses the aggregate `cpu ` line of `/proc/stat`.
fn parse_cpu_line(content: &str) -> Option<(u64, u64, u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    Some((
        fields.get(1)?.parse().ok()?,
        fields.get(2)?.parse().ok()?,
        fields.get(3)?.parse().ok()?,
        fields.get(4)?.parse().ok()?,
    ))
}

/// Pulls a `Name:  <kB> kB` value out of `/proc/meminfo`, scaled to bytes.
fn parse_meminfo_field(content: &str, name: &str) -> Option<u64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(name) {
            let rest = rest.trim_start_matches(':').trim();
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Reads CPU and memory counters for one process.
#[cfg(target_os = "linux")]
pub fn read_process_info(pid: i32) -> anyhow::Result<ProcessInfo> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .with_context(|| format!("read /proc/{pid}/stat"))?;
    let ps = parse_pid_stat(&stat)
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/{pid}/stat"))?;

    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm"))
        .with_context(|| format!("read /proc/{pid}/statm"))?;
    let (shared, text, data) = parse_statm(&statm)
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/{pid}/statm"))?;

    let page = page_size();
    Ok(ProcessInfo {
        user: ps.utime,
        system: ps.stime,
        vsize: ps.vsize,
        rss: ps.rss_pages * page,
        shared: shared * page,
        text: text * page,
        data: data * page,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_process_info(_pid: i32) -> anyhow::Result<ProcessInfo> {
    Ok(ProcessInfo::default())
}

/// Reads system-wide CPU jiffies and memory totals.
#[cfg(target_os = "linux")]
pub fn read_system_info() -> anyhow::Result<SystemInfo> {
    let stat = std::fs::read_to_string("/proc/stat").context("read /proc/stat")?;
    let (user, user_low, system, idle) =
        parse_cpu_line(&stat).ok_or_else(|| anyhow::anyhow!("malformed /proc/stat"))?;

    let meminfo = std::fs::read_to_string("/proc/meminfo").context("read /proc/meminfo")?;
    Ok(SystemInfo {
        user,
        user_low,
        system,
        idle,
        memtotal: parse_meminfo_field(&meminfo, "MemTotal").unwrap_or(0),
        memfree: parse_meminfo_field(&meminfo, "MemFree").unwrap_or(0),
        swaptotal: parse_meminfo_field(&meminfo, "SwapTotal").unwrap_or(0),
        swapfree: parse_meminfo_field(&meminfo, "SwapFree").unwrap_or(0),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_system_info() -> anyhow::Result<SystemInfo> {
    Ok(SystemInfo::default())
}

#[cfg(target_os = "linux")]
fn read_pid_stat(pid: i32) -> Option<PidStat> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_pid_stat(&stat)
}

/// Enumerates all live descendants of `pid` by scanning `/proc` and walking
/// the ppid tree, nearest first.
#[cfg(target_os = "linux")]
pub fn descendants_of(pid: i32) -> Vec<i32> {
    use std::collections::HashMap;

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        if let Some(ps) = read_pid_stat(child) {
            children.entry(ps.ppid).or_default().push(child);
        }
    }

    let mut result = Vec::new();
    let mut stack = vec![pid];
    while let Some(p) = stack.pop() {
        if let Some(kids) = children.get(&p) {
            for &kid in kids {
                result.push(kid);
                stack.push(kid);
            }
        }
    }
    result
}

#[cfg(not(target_os = "linux"))]
pub fn descendants_of(_pid: i32) -> Vec<i32> {
    Vec::new()
}

/// True when `orphan` has been reparented to init but still belongs to the
/// process group and session of its former parent `parent`.
#[cfg(target_os = "linux")]
pub fn is_orphaned_child_of(orphan: i32, parent: i32) -> bool {
    match read_pid_stat(orphan) {
        Some(ps) => ps.ppid == 1 && ps.pgrp == parent && ps.session == parent,
        None => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn is_orphaned_child_of(_orphan: i32, _parent: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_line_with_spaced_comm() {
        let line = "1234 (my proc) S 1 77 77 0 -1 4194560 100 0 0 0 \
                    250 75 0 0 20 0 1 0 12345 104857600 2048 18446744073709551615 \
                    1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        let ps = parse_pid_stat(line).unwrap();
        assert_eq!(ps.ppid, 1);
        assert_eq!(ps.pgrp, 77);
        assert_eq!(ps.session, 77);
        assert_eq!(ps.utime, 250);
        assert_eq!(ps.stime, 75);
        assert_eq!(ps.vsize, 104857600);
        assert_eq!(ps.rss_pages, 2048);
    }

    #[test]
    fn parses_statm_fields() {
        let (shared, text, data) = parse_statm("25600 2048 300 40 0 500 0\n").unwrap();
        assert_eq!(shared, 300);
        assert_eq!(text, 40);
        assert_eq!(data, 500);
    }

    #[test]
    fn parses_aggregate_cpu_line_only() {
        let content = "cpu  100 20 30 4000 5 0 1 0 0 0\n\
                       cpu0 50 10 15 2000 2 0 0 0 0 0\n";
        assert_eq!(parse_cpu_line(content), Some((100, 20, 30, 4000)));
        assert_eq!(parse_cpu_line("intr 1 2 3"), None);
    }

    #[test]
    fn meminfo_values_scale_to_bytes() {
        let content = "MemTotal:       16299920 kB\n\
                       MemFree:         8000000 kB\n\
                       SwapTotal:       2097148 kB\n\
                       SwapFree:        2097148 kB\n";
        assert_eq!(
            parse_meminfo_field(content, "MemTotal"),
            Some(16299920 * 1024)
        );
        assert_eq!(parse_meminfo_field(content, "SwapFree"), Some(2097148 * 1024));
        assert_eq!(parse_meminfo_field(content, "Bogus"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_own_process_info() {
        let pid = std::process::id() as i32;
        let info = read_process_info(pid).unwrap();
        assert!(info.vsize > 0);
        assert!(info.rss > 0);
        let sys = read_system_info().unwrap();
        assert!(sys.memtotal > 0);
    }
}
