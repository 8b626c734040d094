//! Daemon-wide resource sampler.
//!
//! One task walks `/proc` on a timer and refreshes rss, swap, and cpu
//! usage for every live frame's process tree. Supervisors never sample
//! their own children.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::frame::cache::FrameCache;

/// Parsed subset of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy)]
struct ProcStat {
    pid: u32,
    ppid: u32,
    utime_ticks: u64,
    stime_ticks: u64,
    start_ticks: u64,
    rss_pages: u64,
}

fn clock_ticks_per_sec() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

fn page_kb() -> u64 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as u64 / 1024
    } else {
        4
    }
}

/// The comm field is parenthesised and may itself contain spaces, so the
/// numeric fields are taken relative to the last ')'.
fn parse_proc_stat(pid: u32, raw: &str) -> Option<ProcStat> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is state; ppid is stat field 4, utime 14, stime 15,
    // starttime 22, rss 24 (1-based including pid and comm).
    Some(ProcStat {
        pid,
        ppid: fields.get(1)?.parse().ok()?,
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
        start_ticks: fields.get(19)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let raw = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_proc_stat(pid, &raw)
}

/// `VmSwap` from `/proc/<pid>/status`, kilobytes. Zero when absent.
fn read_swap_kb(pid: u32) -> u64 {
    let Ok(status) = fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmSwap:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
        }
    }
    0
}

pub fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

/// Epoch start time of a process, derived from its starttime ticks and the
/// host boot time. Used to decide whether a snapshot pid is really still
/// the frame we launched.
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = read_proc_stat(pid)?;
    let boot = sysinfo::System::boot_time();
    Some(boot + stat.start_ticks / clock_ticks_per_sec())
}

/// Aggregated usage of a process tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeUsage {
    pub rss_kb: u64,
    pub swap_kb: u64,
    pub utime_sec: u64,
    pub stime_sec: u64,
}

/// One full scan of the process table: pid -> stat.
fn scan_proc_table() -> HashMap<u32, ProcStat> {
    let mut table = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if let Some(stat) = read_proc_stat(pid) {
            table.insert(pid, stat);
        }
    }
    table
}

/// Sum usage over `root` and every transitive child found in `table`.
fn tree_usage(root: u32, table: &HashMap<u32, ProcStat>) -> TreeUsage {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for stat in table.values() {
        children.entry(stat.ppid).or_default().push(stat.pid);
    }

    let mut usage = TreeUsage::default();
    let hz = clock_ticks_per_sec();
    let page = page_kb();
    let mut stack = vec![root];
    let mut seen = std::collections::HashSet::new();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(stat) = table.get(&pid) {
            usage.rss_kb += stat.rss_pages * page;
            usage.utime_sec += stat.utime_ticks / hz;
            usage.stime_sec += stat.stime_ticks / hz;
            usage.swap_kb += read_swap_kb(pid);
        }
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids);
        }
    }
    usage
}

/// Sampler loop: refresh every live frame each `interval`, stop with the
/// daemon. A scan failure leaves the previous values in place.
pub async fn run(cache: Arc<FrameCache>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let frames = cache.running();
        if frames.is_empty() {
            continue;
        }
        let table = scan_proc_table();
        if table.is_empty() {
            tracing::warn!("Could not scan /proc, keeping last frame usage");
            continue;
        }
        for frame in frames {
            let pid = frame.pid();
            if pid == 0 {
                continue;
            }
            let usage = tree_usage(pid, &table);
            frame.note_usage(usage.rss_kb, usage.swap_kb, usage.utime_sec, usage.stime_sec);
        }
    }
}
