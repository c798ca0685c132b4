use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn session_start(&self, _direction: &str, _url: &str, _size: u64, _connections: u32) {}
    fn item_done(&self, _action: &str, _offset: u64, _length: u64) {}
    fn retry(&self, _offset: u64, _length: u64, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn session_done(&self, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_start(&self, direction: &str, url: &str, size: u64, connections: u32) {
        self.line(&format!(
            "START dir={direction} url={url} size={size} connections={connections}"
        ));
    }
    fn item_done(&self, action: &str, offset: u64, length: u64) {
        self.line(&format!("ITEM action={action} offset={offset} length={length}"));
    }
    fn retry(&self, offset: u64, length: u64, msg: &str) {
        self.line(&format!("RETRY offset={offset} length={length} msg={msg}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn session_done(&self, bytes: u64, seconds: f64) {
        self.line(&format!("DONE bytes={bytes} seconds={seconds:.3}"));
    }
}
