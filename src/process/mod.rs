//! Process enumeration and the watch list.
//!
//! A [`WatchedProc`] gives every live process matching its pattern a small
//! integer id that stays stable for as long as the pid is observed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;

use anyhow::Result;
use regex::Regex;
use thiserror::Error;
use tracing::debug;
#[cfg(not(target_os = "linux"))]
use tracing::warn;

/// An OS process as seen by one enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub command: String,
    pub arguments: String,
}

impl Process {
    /// Builds a process from a NUL-separated command line. Returns `None` for
    /// kernel threads and other processes with an empty command.
    pub fn from_cmdline(pid: u32, raw: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut parts = text.split('\0');
        let command = parts.next().filter(|c| !c.is_empty())?.to_string();
        let arguments = parts.collect::<Vec<_>>().concat();
        Some(Self {
            pid,
            command,
            arguments,
        })
    }
}

/// A watched pid whose required artifacts could not be read.
#[derive(Error, Debug)]
#[error("process {pid} gone: reading {artifact}")]
pub struct ProcessGone {
    pub pid: u32,
    pub artifact: &'static str,
    #[source]
    pub source: io::Error,
}

/// Lists every process with a readable, non-empty command line.
#[cfg(target_os = "linux")]
pub fn enumerate() -> Result<Vec<Process>> {
    use anyhow::Context;
    use std::fs;

    let entries = fs::read_dir("/proc").context("reading /proc")?;
    let mut procs = Vec::with_capacity(256);

    for entry in entries {
        let Ok(entry) = entry else { continue };

        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };

        // The process may have exited since the directory was listed.
        let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) else {
            continue;
        };

        if let Some(p) = Process::from_cmdline(pid, &raw) {
            procs.push(p);
        }
    }

    debug!(count = procs.len(), "enumerated processes");

    Ok(procs)
}

#[cfg(not(target_os = "linux"))]
pub fn enumerate() -> Result<Vec<Process>> {
    warn!("process enumeration is only supported on Linux");
    Ok(Vec::new())
}

/// Hands out small ids, reusing the lowest released one first.
#[derive(Debug)]
pub struct IdPool {
    next: usize,
    free: BTreeSet<usize>,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    pub fn get(&mut self) -> usize {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn put(&mut self, id: usize) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One watch list entry: a named pattern and the pids it currently tracks.
#[derive(Debug)]
pub struct WatchedProc {
    pub name: String,
    pub command: String,
    pub arg_match: Regex,
    processes: HashMap<u32, usize>,
    pool: IdPool,
}

impl WatchedProc {
    /// `command` is matched as a substring of the executable path, `args` as a
    /// regex over the joined arguments.
    pub fn new(name: &str, command: &str, args: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            command: command.to_string(),
            arg_match: Regex::new(args)?,
            processes: HashMap::new(),
            pool: IdPool::new(),
        })
    }

    pub fn matches(&self, p: &Process) -> bool {
        p.command.contains(&self.command) && self.arg_match.is_match(&p.arguments)
    }

    /// Reconciles the tracked pids against a fresh enumeration.
    ///
    /// Known pids keep their id, new matches get the next free id and pids no
    /// longer matched release theirs.
    pub fn check(&mut self, procs: &[Process]) {
        let matched: Vec<u32> = procs
            .iter()
            .filter(|p| self.matches(p))
            .map(|p| p.pid)
            .collect();
        let seen: HashSet<u32> = matched.iter().copied().collect();

        for pid in matched {
            if !self.processes.contains_key(&pid) {
                let id = self.pool.get();
                debug!(watch = %self.name, pid, id, "watching process");
                self.processes.insert(pid, id);
            }
        }

        let gone: Vec<u32> = self
            .processes
            .keys()
            .filter(|pid| !seen.contains(pid))
            .copied()
            .collect();
        for pid in gone {
            self.remove(pid);
        }
    }

    /// Stops tracking `pid` and releases its id.
    pub fn remove(&mut self, pid: u32) -> Option<usize> {
        let id = self.processes.remove(&pid)?;
        self.pool.put(id);
        debug!(watch = %self.name, pid, id, "process released");
        Some(id)
    }

    pub fn id(&self, pid: u32) -> Option<usize> {
        self.processes.get(&pid).copied()
    }

    /// Tracked `(pid, id)` pairs ordered by id.
    pub fn processes(&self) -> Vec<(u32, usize)> {
        let mut out: Vec<(u32, usize)> = self.processes.iter().map(|(p, i)| (*p, *i)).collect();
        out.sort_unstable_by_key(|(_, id)| *id);
        out
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
