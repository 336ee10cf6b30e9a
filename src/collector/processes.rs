use std::io;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use super::IntervalCollector;
use crate::context::AgentContext;
use crate::datapoint::{MultiDataPoint, TagSet, Value};
use crate::metadata::{Hint, Unit};
use crate::process::{self, Process, ProcessGone, WatchedProc};

pub const NAME: &str = "linux_processes";

const DESC_CPU_USER: &str = "Time this process has been scheduled in user mode.";
const DESC_CPU_SYSTEM: &str = "Time this process has been scheduled in kernel mode.";
const DESC_FAULT_MIN: &str = "Minor faults that did not require loading a page from disk.";
const DESC_FAULT_MAJ: &str = "Major faults that required loading a page from disk.";
const DESC_VIRTUAL: &str = "Virtual memory size.";
const DESC_RSS: &str = "Resident set size in pages.";
const DESC_CHAR_READ: &str = "Bytes passed to read(2) and similar calls.";
const DESC_CHAR_WRITE: &str = "Bytes passed to write(2) and similar calls.";
const DESC_SYSCALL_READ: &str = "Read I/O system calls.";
const DESC_SYSCALL_WRITE: &str = "Write I/O system calls.";
const DESC_IO_READ: &str = "Bytes fetched from the storage layer.";
const DESC_IO_WRITE: &str = "Bytes sent to the storage layer.";
const DESC_FDS: &str = "Open file descriptors.";
const DESC_FDS_SOFT: &str = "Soft limit on open file descriptors.";
const DESC_FDS_HARD: &str = "Hard limit on open file descriptors.";
const DESC_COUNT: &str = "Live processes matching the watch entry.";

/// Per-process OS artifacts. Every read must succeed for a pid to be reported.
pub trait ProcReader: Send {
    fn stat(&self, pid: u32) -> io::Result<String>;
    fn io(&self, pid: u32) -> io::Result<String>;
    fn limits(&self, pid: u32) -> io::Result<String>;
    fn fd_count(&self, pid: u32) -> io::Result<usize>;
}

/// Reads artifacts from `/proc`.
pub struct ProcFs;

impl ProcReader for ProcFs {
    fn stat(&self, pid: u32) -> io::Result<String> {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
    }

    fn io(&self, pid: u32) -> io::Result<String> {
        std::fs::read_to_string(format!("/proc/{pid}/io"))
    }

    fn limits(&self, pid: u32) -> io::Result<String> {
        std::fs::read_to_string(format!("/proc/{pid}/limits"))
    }

    fn fd_count(&self, pid: u32) -> io::Result<usize> {
        std::fs::read_dir(format!("/proc/{pid}/fd"))?.try_fold(0, |n, e| e.map(|_| n + 1))
    }
}

struct Artifacts {
    stat: String,
    io: String,
    limits: String,
    fds: usize,
}

fn gone(pid: u32, artifact: &'static str) -> impl FnOnce(io::Error) -> ProcessGone {
    move |source| ProcessGone {
        pid,
        artifact,
        source,
    }
}

fn read_artifacts(reader: &dyn ProcReader, pid: u32) -> Result<Artifacts, ProcessGone> {
    Ok(Artifacts {
        stat: reader.stat(pid).map_err(gone(pid, "stat"))?,
        io: reader.io(pid).map_err(gone(pid, "io"))?,
        limits: reader.limits(pid).map_err(gone(pid, "limits"))?,
        fds: reader.fd_count(pid).map_err(gone(pid, "fd"))?,
    })
}

/// Splits `/proc/<pid>/stat` into fields, keeping a command name that
/// contains spaces as one field so indexes match proc(5).
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let mut fields = vec![stat.get(..open)?.trim(), stat.get(open + 1..close)?];
    fields.extend(stat.get(close + 1..)?.split_whitespace());
    Some(fields)
}

/// Values of the `key: value` lines of `/proc/<pid>/io`, in file order.
fn io_fields(io: &str) -> Vec<&str> {
    io.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(_), Some(v), None) => Some(v),
                _ => None,
            }
        })
        .collect()
}

/// Soft and hard `Max open files` limits, `None` when unlimited or absent.
fn fd_limits(limits: &str) -> Option<(&str, &str)> {
    limits.lines().find_map(|line| {
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() == 6 && f[..3] == ["Max", "open", "files"] && f[3] != "unlimited" {
            Some((f[3], f[4]))
        } else {
            None
        }
    })
}

fn num(s: &str) -> Result<Value> {
    s.parse().with_context(|| format!("parsing {s:?}"))
}

/// Reports per-process metrics for every watch list entry.
pub struct ProcessCollector<R: ProcReader> {
    watches: Vec<WatchedProc>,
    reader: R,
}

impl<R: ProcReader> ProcessCollector<R> {
    pub fn new(watches: Vec<WatchedProc>, reader: R) -> Self {
        Self { watches, reader }
    }

    pub fn watches(&self) -> &[WatchedProc] {
        &self.watches
    }

    /// Reconciles each watch against `procs` and appends its pids' points
    /// to `md`.
    ///
    /// A pid with any unreadable artifact is dropped from its watch. A pid
    /// with malformed content contributes no points and fails the cycle, but
    /// stays watched; every other pid is still reported.
    pub fn collect(&mut self, procs: &[Process], ctx: &AgentContext, md: &mut MultiDataPoint) -> Result<()> {
        let mut last_err = None;

        for w in &mut self.watches {
            w.check(procs);

            for (pid, id) in w.processes() {
                let artifacts = match read_artifacts(&self.reader, pid) {
                    Ok(a) => a,
                    Err(gone) => {
                        debug!(watch = %w.name, error = %gone, "dropping process");
                        w.remove(pid);
                        continue;
                    }
                };

                let tags = TagSet::new()
                    .with("name", w.name.as_str())
                    .with("id", id.to_string());
                let mut points = MultiDataPoint::new();
                match report(ctx, &mut points, &artifacts, &tags) {
                    Ok(()) => md.append(&mut points),
                    Err(e) => {
                        warn!(watch = %w.name, pid, error = %e, "skipping process");
                        last_err = Some(e.context(format!("pid {pid}")));
                    }
                }
            }

            ctx.health()
                .watched_processes
                .with_label_values(&[w.name.as_str()])
                .set(w.len() as f64);
            ctx.add(
                md,
                "linux.proc.count",
                w.len(),
                TagSet::new().with("name", w.name.as_str()),
                Hint::gauge(Unit::Process, DESC_COUNT),
            );
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn report(ctx: &AgentContext, md: &mut MultiDataPoint, a: &Artifacts, tags: &TagSet) -> Result<()> {
    let stats = stat_fields(&a.stat).filter(|f| f.len() >= 24);
    let stats = stats.ok_or_else(|| anyhow!("stat too short"))?;
    let io = io_fields(&a.io);
    if io.len() < 6 {
        return Err(anyhow!("io too short"));
    }

    if let Some((soft, hard)) = fd_limits(&a.limits) {
        let soft_hint = Hint::gauge(Unit::Files, DESC_FDS_SOFT);
        let hard_hint = Hint::gauge(Unit::Files, DESC_FDS_HARD);
        ctx.add(md, "linux.proc.num_fds_slim", num(soft)?, tags.clone(), soft_hint);
        ctx.add(md, "linux.proc.num_fds_hlim", num(hard)?, tags.clone(), hard_hint);
    }

    let readings = [
        ("linux.proc.cpu", stats[13], Some("user"), Hint::counter(Unit::Pct, DESC_CPU_USER)),
        ("linux.proc.cpu", stats[14], Some("system"), Hint::counter(Unit::Pct, DESC_CPU_SYSTEM)),
        ("linux.proc.mem.fault", stats[9], Some("minflt"), Hint::counter(Unit::Fault, DESC_FAULT_MIN)),
        ("linux.proc.mem.fault", stats[11], Some("majflt"), Hint::counter(Unit::Fault, DESC_FAULT_MAJ)),
        ("linux.proc.mem.virtual", stats[22], None, Hint::gauge(Unit::Bytes, DESC_VIRTUAL)),
        ("linux.proc.mem.rss", stats[23], None, Hint::gauge(Unit::Page, DESC_RSS)),
        ("linux.proc.char_io", io[0], Some("read"), Hint::counter(Unit::Bytes, DESC_CHAR_READ)),
        ("linux.proc.char_io", io[1], Some("write"), Hint::counter(Unit::Bytes, DESC_CHAR_WRITE)),
        ("linux.proc.syscall", io[2], Some("read"), Hint::counter(Unit::Syscall, DESC_SYSCALL_READ)),
        ("linux.proc.syscall", io[3], Some("write"), Hint::counter(Unit::Syscall, DESC_SYSCALL_WRITE)),
        ("linux.proc.io_bytes", io[4], Some("read"), Hint::counter(Unit::Bytes, DESC_IO_READ)),
        ("linux.proc.io_bytes", io[5], Some("write"), Hint::counter(Unit::Bytes, DESC_IO_WRITE)),
    ];
    for (metric, raw, kind, hint) in readings {
        let value = num(raw)?;
        let tags = match kind {
            Some(t) => tags.clone().with("type", t),
            None => tags.clone(),
        };
        ctx.add(md, metric, value, tags, hint);
    }

    let fds_hint = Hint::gauge(Unit::Files, DESC_FDS);
    ctx.add(md, "linux.proc.num_fds", a.fds, tags.clone(), fds_hint);

    Ok(())
}

/// Wraps the watch list in an interval collector that enumerates `/proc` on
/// every tick.
pub fn watch_processes(watches: Vec<WatchedProc>) -> IntervalCollector {
    let mut collector = ProcessCollector::new(watches, ProcFs);
    IntervalCollector::new(NAME, move |ctx: &AgentContext, md: &mut MultiDataPoint| {
        let procs = process::enumerate()?;
        collector.collect(&procs, ctx, md)
    })
}
