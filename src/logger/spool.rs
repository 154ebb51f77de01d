//! On-disk spool of rotated, gzip-compressed NDJSON files.

use std::{
    collections::VecDeque,
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
};

use flate2::{write::GzEncoder, Compression};
use tempfile::TempDir;
use uuid::Uuid;

/// Compressed size after which the current file is rotated, in bytes.
pub(crate) const MAX_FILE_SIZE: u64 = 1_000_000;
/// Maximum number of closed files retained on disk.
pub(crate) const MAX_FILES: usize = 50;

/// The currently open spool file.
#[derive(Debug)]
struct OpenGzipFile {
    uuid: Uuid,
    path: PathBuf,
    encoder: GzEncoder<File>,
    /// Compressed bytes written so far.
    size: u64,
}

impl OpenGzipFile {
    fn create(dir: PathBuf) -> io::Result<Self> {
        let uuid = Uuid::new_v4();
        let path = dir.join(format!("{uuid}.gz"));
        let file = File::create(&path)?;
        Ok(Self {
            uuid,
            path,
            encoder: GzEncoder::new(file, Compression::default()),
            size: 0,
        })
    }

    /// Append one newline-terminated record.
    fn write_line(&mut self, data: &[u8]) -> io::Result<()> {
        self.encoder.write_all(data)?;
        self.encoder.write_all(b"\n")?;
        self.encoder.flush()?;
        self.size = self.encoder.get_ref().metadata()?.len();
        Ok(())
    }

    fn close(mut self) -> io::Result<ClosedGzipFile> {
        self.encoder.try_finish()?;
        let size = self.encoder.get_ref().metadata()?.len();
        Ok(ClosedGzipFile {
            uuid: self.uuid,
            path: self.path,
            size,
        })
    }
}

/// A closed spool file awaiting upload.
#[derive(Debug)]
pub(crate) struct ClosedGzipFile {
    pub(crate) uuid: Uuid,
    path: PathBuf,
    pub(crate) size: u64,
}

impl ClosedGzipFile {
    /// Raw compressed payload for transport.
    pub(crate) fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Remove the file from disk. Errors are ignored.
    pub(crate) fn delete(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Ordered queue of gzip files holding newline-delimited JSON records.
///
/// The spool directory is a fresh temp directory per process, removed when
/// the spool is dropped. At most [`MAX_FILES`] closed files are retained;
/// oldest files are dropped first.
#[derive(Debug)]
pub(crate) struct TempGzipSpool {
    dir: TempDir,
    current: Option<OpenGzipFile>,
    files: VecDeque<ClosedGzipFile>,
}

impl TempGzipSpool {
    /// Create the spool directory.
    ///
    /// Failure here means the system temp directory is not writable, which
    /// disables request logging for the life of the process.
    pub(crate) fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("apitally-").tempdir()?;
        Ok(Self {
            dir,
            current: None,
            files: VecDeque::new(),
        })
    }

    /// Append one record to the current file, opening one if needed.
    pub(crate) fn write_line(&mut self, data: &[u8]) -> io::Result<()> {
        let file = match &mut self.current {
            Some(file) => file,
            None => self
                .current
                .insert(OpenGzipFile::create(self.dir.path().to_owned())?),
        };
        file.write_line(data)
    }

    /// Close the current file, if any, and enqueue it for upload.
    pub(crate) fn rotate(&mut self) -> io::Result<()> {
        if let Some(file) = self.current.take() {
            self.files.push_back(file.close()?);
            self.enforce_retention();
        }
        Ok(())
    }

    /// Rotate only if the current file has outgrown [`MAX_FILE_SIZE`].
    pub(crate) fn rotate_if_full(&mut self) -> io::Result<()> {
        if self
            .current
            .as_ref()
            .is_some_and(|file| file.size > MAX_FILE_SIZE)
        {
            self.rotate()?;
        }
        Ok(())
    }

    fn enforce_retention(&mut self) {
        while self.files.len() > MAX_FILES {
            if let Some(file) = self.files.pop_front() {
                file.delete();
            }
        }
    }

    /// Take the oldest closed file for upload.
    pub(crate) fn pop_file(&mut self) -> Option<ClosedGzipFile> {
        self.files.pop_front()
    }

    /// Put a file back at the front of the queue after a failed upload.
    pub(crate) fn requeue_file(&mut self, file: ClosedGzipFile) {
        self.files.push_front(file);
    }

    /// Number of closed files currently held.
    pub(crate) fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Delete all spool contents, open and closed.
    pub(crate) fn clear(&mut self) {
        if let Some(file) = self.current.take() {
            if let Ok(closed) = file.close() {
                closed.delete();
            }
        }
        for file in self.files.drain(..) {
            file.delete();
        }
    }
}
