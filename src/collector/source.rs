use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Tails a JSON-lines log file by byte offset.
///
/// Each `poll` returns the complete lines appended since the last call. A
/// trailing line without its newline is held back until it is finished. If
/// the file shrinks (rotation by truncation) reading restarts from the top.
pub struct FileTailSource {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl FileTailSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: String::new(),
        }
    }

    /// Start at the current end of the file, skipping existing content.
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let mut source = Self::new(path);
        if let Ok(meta) = std::fs::metadata(&source.path) {
            source.offset = meta.len();
        }
        source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn poll(&mut self) -> Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            // Not created yet; nothing to read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", self.path.display()));
            }
        };
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", self.path.display()))?
            .len();

        if len < self.offset {
            tracing::info!(path = %self.path.display(), "log file truncated, reading from start");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .context("Failed to seek log file")?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        let read = file
            .take(len - self.offset)
            .read_to_end(&mut buf)
            .context("Failed to read log file")?;
        self.offset += read as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buf));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }
}
