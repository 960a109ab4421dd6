//! Persistent plan registry.
//!
//! Maps problem signatures to the best measured kernel descriptor. The file
//! is line oriented:
//!
//! ```text
//! # planner-v1
//! <sig> | <op> | <kernel descriptor> | <hw fingerprint> | <score ns> | <gflops> | <seed> | <unix time>
//! ```
//!
//! Readers work on an immutable [`RegistrySnapshot`]; saving merges with the
//! file on disk under an exclusive `<path>.lock` and replaces it atomically.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use primkit_core::{PrimError, Result};
use primkit_kernels::{KernelDescriptor, PlanLookup};
use primkit_layout::{OpKind, Problem};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signature::signature;

pub const REGISTRY_HEADER: &str = "# planner-v1";

const LOCK_ATTEMPTS: u32 = 100;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRegistryEntry {
    pub sig: String,
    pub op: OpKind,
    pub desc: KernelDescriptor,
    /// HW fingerprint the entry was measured on.
    pub hw: String,
    /// Mean latency over the problem set.
    pub score_ns: f64,
    pub gflops: f64,
    /// Problem-set seed.
    pub seed: u64,
    pub timestamp: u64,
}

impl PlanRegistryEntry {
    /// Lower score wins; equal scores fall back to the descriptor fingerprint.
    pub fn is_better_than(&self, other: &PlanRegistryEntry) -> bool {
        match self.score_ns.total_cmp(&other.score_ns) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.desc.fingerprint() < other.desc.fingerprint(),
        }
    }

    /// One-line JSON rendering for machine consumers.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        let bad = |what: String| PrimError::invalid(format!("registry line: {what}"));
        let [sig, op, desc, hw, score, gflops, seed, timestamp] = cols.as_slice() else {
            return Err(bad(format!("expected 8 columns, got {}", cols.len())));
        };
        if sig.is_empty() || !sig.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad(format!("bad signature '{sig}'")));
        }
        let op: OpKind = op.parse().map_err(bad)?;
        let desc: KernelDescriptor = desc.parse()?;
        if desc.op != op {
            return Err(bad(format!("descriptor op {} != {op}", desc.op)));
        }
        let number = |v: &str, what: &str| -> Result<f64> {
            v.parse::<f64>()
                .ok()
                .filter(|x| x.is_finite() && *x >= 0.0)
                .ok_or_else(|| bad(format!("bad {what} '{v}'")))
        };
        Ok(Self {
            sig: sig.to_string(),
            op,
            desc,
            hw: hw.to_string(),
            score_ns: number(score, "score")?,
            gflops: number(gflops, "gflops")?,
            seed: seed.parse().map_err(|_| bad(format!("bad seed '{seed}'")))?,
            timestamp: timestamp
                .parse()
                .map_err(|_| bad(format!("bad timestamp '{timestamp}'")))?,
        })
    }
}

impl fmt::Display for PlanRegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} | {} | {} | {} | {} | {}",
            self.sig,
            self.op,
            self.desc,
            self.hw,
            self.score_ns,
            self.gflops,
            self.seed,
            self.timestamp
        )
    }
}

/// In-memory registry with an optional backing file.
#[derive(Debug, Clone, Default)]
pub struct PlanRegistry {
    path: Option<PathBuf>,
    entries: BTreeMap<String, PlanRegistryEntry>,
}

impl PlanRegistry {
    /// Ephemeral registry, never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path`; a missing file yields an empty registry bound to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => parse_entries(&text, &path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(PrimError::RegistryIo { path, source }),
        };
        debug!(path = %path.display(), entries = entries.len(), "plan registry loaded");
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlanRegistryEntry> {
        self.entries.values()
    }

    pub fn get(&self, sig: &str) -> Option<&PlanRegistryEntry> {
        self.entries.get(sig)
    }

    pub fn lookup(&self, problem: &Problem) -> Option<&PlanRegistryEntry> {
        self.entries.get(&signature(problem))
    }

    /// Inserts `entry` unless an at-least-as-good one is stored; true on change.
    pub fn upsert(&mut self, entry: PlanRegistryEntry) -> bool {
        upsert_into(&mut self.entries, entry)
    }

    /// File contents for the current entries, sorted by signature.
    pub fn render(&self) -> String {
        render_entries(&self.entries)
    }

    /// Merges with the file on disk and replaces it atomically.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let io_err = |source: io::Error| PrimError::RegistryIo {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let _lock = LockFile::acquire(&path).map_err(io_err)?;

        match fs::read_to_string(&path) {
            Ok(text) => {
                for entry in parse_entries(&text, &path).into_values() {
                    upsert_into(&mut self.entries, entry);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let tmp = tmp_path(&path);
        let write = || -> io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(self.render().as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        debug!(path = %path.display(), entries = self.entries.len(), "plan registry saved");
        Ok(())
    }

    /// Immutable view for dispatchers; later upserts are not visible through it.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::new(RegistrySnapshot {
            plans: self
                .entries
                .iter()
                .map(|(sig, e)| (sig.clone(), e.desc.clone()))
                .collect(),
        })
    }
}

fn upsert_into(entries: &mut BTreeMap<String, PlanRegistryEntry>, entry: PlanRegistryEntry) -> bool {
    match entries.get(&entry.sig) {
        Some(existing) if !entry.is_better_than(existing) => false,
        _ => {
            entries.insert(entry.sig.clone(), entry);
            true
        }
    }
}

fn render_entries(entries: &BTreeMap<String, PlanRegistryEntry>) -> String {
    let mut out = String::from(REGISTRY_HEADER);
    out.push('\n');
    for entry in entries.values() {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}

fn parse_entries(text: &str, path: &Path) -> BTreeMap<String, PlanRegistryEntry> {
    let mut entries = BTreeMap::new();
    let mut lines = text.lines().enumerate().peekable();
    if let Some((_, first)) = lines.peek() {
        if first.trim() != REGISTRY_HEADER {
            warn!(path = %path.display(), "plan registry without '{REGISTRY_HEADER}' header");
        }
    }
    for (no, line) in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match PlanRegistryEntry::parse_line(line) {
            Ok(entry) => {
                upsert_into(&mut entries, entry);
            }
            Err(e) => warn!(path = %path.display(), line = no + 1, "skipping malformed entry: {e}"),
        }
    }
    entries
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

/// Exclusive `<path>.lock`, removed on drop.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(target: &Path) -> io::Result<Self> {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let path = target.with_file_name(name);
        for attempt in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 {
                        debug!(lock = %path.display(), "waiting for registry lock");
                    }
                    thread::sleep(LOCK_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("lock {} is held by another writer", path.display()),
        ))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Signature → descriptor map frozen at creation.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    plans: HashMap<String, KernelDescriptor>,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl PlanLookup for RegistrySnapshot {
    fn lookup(&self, problem: &Problem) -> Option<KernelDescriptor> {
        self.plans.get(&signature(problem)).cloned()
    }
}
