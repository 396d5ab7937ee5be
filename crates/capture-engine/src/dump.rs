//! Raw elementary-stream dump.
//!
//! Appends every encoded access unit to a file so the stream can be played
//! back with any Annex-B aware tool. Write failures are logged and never
//! fail a capture.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nvcap_common::error::NvcapResult;

pub(crate) struct BitstreamDump {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl BitstreamDump {
    pub fn create(path: &Path) -> NvcapResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::options().create(true).append(true).open(path)?;
        tracing::info!(path = %path.display(), "Dumping bitstream");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Open the sink if a path is configured; a failure disables dumping.
    pub fn open_optional(path: Option<&Path>) -> Option<Self> {
        let path = path?;
        match Self::create(path) {
            Ok(dump) => Some(dump),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Bitstream dump disabled");
                None
            }
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        let result = self
            .writer
            .write_all(data)
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => self.bytes_written += data.len() as u64,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Bitstream dump write failed");
            }
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
