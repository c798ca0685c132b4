//! Shared transfer progress
//!
//! One `Progress` aggregate is handed by reference to every worker. The
//! counter is monotonic and mutated under a single lock; raw byte deltas
//! are pushed to an attached sink, while pollers read the running total.
//! Rendering (text bar, JSON lines) lives in the sinks, not the counter.

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

/// Push-style observer for byte deltas. Implemented by the bundled
/// renderers and by caller-supplied callbacks.
pub trait ProgressSink: Send + Sync {
    fn set_size(&self, _size: u64) {}
    fn set_phase(&self, _phase: &str) {}
    /// Called once per completed work item with the item's byte length.
    fn update(&self, n: u64);
    fn finish(&self) {}
}

#[derive(Default)]
struct State {
    transferred: u64,
    size: Option<u64>,
}

/// Lock-guarded monotonic counter shared by all workers.
pub struct Progress {
    state: Mutex<State>,
    sink: Option<Box<dyn ProgressSink>>,
}

impl Progress {
    pub fn new(sink: Option<Box<dyn ProgressSink>>) -> Arc<Self> {
        Arc::new(Progress {
            state: Mutex::new(State::default()),
            sink,
        })
    }

    pub fn set_size(&self, size: u64) {
        self.state.lock().size = Some(size);
        if let Some(sink) = &self.sink {
            sink.set_size(size);
        }
    }

    pub fn set_phase(&self, phase: &str) {
        if let Some(sink) = &self.sink {
            sink.set_phase(phase);
        }
    }

    /// Add `n` transferred bytes. The counter only increases.
    pub fn update(&self, n: u64) {
        self.state.lock().transferred += n;
        if let Some(sink) = &self.sink {
            sink.update(n);
        }
    }

    /// Polling accessor for the running total.
    pub fn transferred(&self) -> u64 {
        self.state.lock().transferred
    }

    pub fn size(&self) -> Option<u64> {
        self.state.lock().size
    }

    pub fn finish(&self) {
        if let Some(sink) = &self.sink {
            sink.finish();
        }
    }
}

/// Callback adapter: delivers raw byte deltas to a plain closure.
pub struct FnSink<F: Fn(u64) + Send + Sync>(pub F);

impl<F: Fn(u64) + Send + Sync> ProgressSink for FnSink<F> {
    fn update(&self, n: u64) {
        (self.0)(n);
    }
}

/// Human-readable progress bar.
pub struct TextBar {
    bar: ProgressBar,
}

impl TextBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[ {percent:>3}% ] {bytes} {msg} {elapsed_precise} {binary_bytes_per_sec}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        TextBar { bar }
    }
}

impl Default for TextBar {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TextBar {
    fn set_size(&self, size: u64) {
        self.bar.set_length(size);
    }

    fn set_phase(&self, phase: &str) {
        self.bar.set_message(phase.to_string());
    }

    fn update(&self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

struct JsonState {
    transferred: u64,
    size: Option<u64>,
    phase: String,
    /// Last whole percent written; starts below zero so the first update
    /// emits a line.
    percent: i64,
}

/// Machine-readable progress: one JSON object per whole-percent change.
pub struct JsonLines {
    out: Mutex<Box<dyn Write + Send>>,
    state: Mutex<JsonState>,
    start: Instant,
}

impl JsonLines {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        JsonLines {
            out: Mutex::new(out),
            state: Mutex::new(JsonState {
                transferred: 0,
                size: None,
                phase: String::new(),
                percent: -1,
            }),
            start: Instant::now(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn draw(&self, state: &JsonState) {
        let line = json!({
            "transferred": state.transferred,
            "size": state.size,
            "elapsed": self.start.elapsed().as_secs_f64(),
            "description": state.phase,
        });
        let mut out = self.out.lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl ProgressSink for JsonLines {
    fn set_size(&self, size: u64) {
        let mut state = self.state.lock();
        state.size = Some(size);
    }

    fn set_phase(&self, phase: &str) {
        let mut state = self.state.lock();
        if state.phase != phase {
            state.phase = phase.to_string();
            self.draw(&state);
        }
    }

    fn update(&self, n: u64) {
        let mut state = self.state.lock();
        state.transferred += n;
        if let Some(size) = state.size.filter(|s| *s > 0) {
            let percent = (state.transferred * 100 / size) as i64;
            if percent > state.percent {
                state.percent = percent;
                self.draw(&state);
            }
        } else {
            self.draw(&state);
        }
    }

    fn finish(&self) {
        let state = self.state.lock();
        self.draw(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_is_monotonic_under_concurrency() {
        let progress = Progress::new(None);
        progress.set_size(4000);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = Arc::clone(&progress);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    p.update(5);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(progress.transferred(), 4000);
        assert_eq!(progress.size(), Some(4000));
    }

    #[test]
    fn callback_receives_raw_deltas_in_any_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let progress = Progress::new(Some(Box::new(FnSink(move |n| {
            sink_seen.lock().push(n);
        }))));

        let deltas = [4096u64, 28672, 4096, 28672];
        let mut handles = Vec::new();
        for d in deltas {
            let p = Arc::clone(&progress);
            handles.push(thread::spawn(move || p.update(d)));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut got = seen.lock().clone();
        let mut want = deltas.to_vec();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want);
        assert_eq!(progress.transferred(), deltas.iter().sum::<u64>());
    }

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines_coalesce_to_percent_steps() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = JsonLines::new(Box::new(SharedBuf(Arc::clone(&buf))));
        sink.set_size(1000);
        // 9 updates of 1 byte each stay inside 1%: only the first (0->0%)
        // line is drawn because percent starts at -1.
        for _ in 0..9 {
            sink.update(1);
        }
        let lines: Vec<String> = String::from_utf8(buf.lock().clone())
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 1);

        // Crossing to 50% draws exactly one more line.
        sink.update(491);
        let text = String::from_utf8(buf.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        let last: serde_json::Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last["transferred"], 500);
        assert_eq!(last["size"], 1000);
    }
}
