use anyhow::Context;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// File sink for DAP traffic, one JSON message per line.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }

    /// Message read from the front end.
    pub fn inbound<T: Serialize>(&self, msg: &T) {
        if let Ok(line) = serde_json::to_string(msg) {
            self.line(&format!("<- {line}"));
        }
    }

    /// Message written to the front end.
    pub fn outbound<T: Serialize>(&self, msg: &T) {
        if let Ok(line) = serde_json::to_string(msg) {
            self.line(&format!("-> {line}"));
        }
    }
}
