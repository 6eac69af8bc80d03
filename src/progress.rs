//! Batch progress reporting.
//!
//! Long phases (acquisition, QA, OCR, canonicalization) report observable
//! progress so operators can see how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait Progress: Send + Sync {
    /// A phase with `total` items is starting.
    fn begin(&self, total: u64, label: &str);
    /// `n` more items completed.
    fn advance(&self, n: u64);
    /// One identified item completed. Reporters tag the line with its
    /// ordinal so interleaved output from concurrent workers stays
    /// attributable.
    fn item(&self, detail: &str);
    /// The phase finished; `summary` describes the tally.
    fn finish(&self, summary: &str);
}

/// Human-friendly progress on stderr: "acquiring label documents  1,234 / 5,000".
pub struct StderrProgress {
    label: std::sync::Mutex<String>,
    done: AtomicU64,
    total: AtomicU64,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            label: std::sync::Mutex::new(String::new()),
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn emit(&self) {
        let label = self.label.lock().expect("progress label lock").clone();
        let line = format!(
            "{}  {} / {}\n",
            label,
            format_number(self.done.load(Ordering::Relaxed)),
            format_number(self.total.load(Ordering::Relaxed))
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for StderrProgress {
    fn begin(&self, total: u64, label: &str) {
        *self.label.lock().expect("progress label lock") = label.to_string();
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.emit();
    }

    fn advance(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
        self.emit();
    }

    fn item(&self, detail: &str) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        let _ = writeln!(std::io::stderr().lock(), "{}", item_line(done, total, detail));
    }

    fn finish(&self, summary: &str) {
        let label = self.label.lock().expect("progress label lock").clone();
        let _ = writeln!(std::io::stderr().lock(), "{}  done: {}", label, summary);
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress {
    label: std::sync::Mutex<String>,
    done: AtomicU64,
    total: AtomicU64,
}

impl JsonProgress {
    pub fn new() -> Self {
        Self {
            label: std::sync::Mutex::new(String::new()),
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn emit(&self, phase: &str, summary: Option<&str>) {
        let label = self.label.lock().expect("progress label lock").clone();
        let mut obj = serde_json::json!({
            "event": "progress",
            "label": label,
            "phase": phase,
            "n": self.done.load(Ordering::Relaxed),
            "total": self.total.load(Ordering::Relaxed),
        });
        if let Some(summary) = summary {
            obj["summary"] = serde_json::json!(summary);
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

impl Default for JsonProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for JsonProgress {
    fn begin(&self, total: u64, label: &str) {
        *self.label.lock().expect("progress label lock") = label.to_string();
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.emit("begin", None);
    }

    fn advance(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
        self.emit("running", None);
    }

    fn item(&self, detail: &str) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let label = self.label.lock().expect("progress label lock").clone();
        let obj = serde_json::json!({
            "event": "item",
            "label": label,
            "n": done,
            "total": self.total.load(Ordering::Relaxed),
            "detail": detail,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }

    fn finish(&self, summary: &str) {
        self.emit("finished", Some(summary));
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl Progress for NoProgress {
    fn begin(&self, _total: u64, _label: &str) {}
    fn advance(&self, _n: u64) {}
    fn item(&self, _detail: &str) {}
    fn finish(&self, _summary: &str) {}
}

fn item_line(done: u64, total: u64, detail: &str) -> String {
    format!("  [{}/{}] {}", format_number(done), format_number(total), detail)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn Progress> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress::new()),
            ProgressMode::Json => Arc::new(JsonProgress::new()),
        }
    }
}
