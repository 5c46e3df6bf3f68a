use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::message::Message;
use crate::Result;

pub(crate) const LARGE_MESSAGE_EXTENSION: &str = "msg";

pub(crate) fn large_message_path(directory: &Path, message_id: u64) -> PathBuf {
    directory.join(format!("{message_id:019}.{LARGE_MESSAGE_EXTENSION}"))
}

/// Streams a large body to its own file, chunk by chunk.
///
/// `seal` syncs the file and returns the message flagged as large; its body
/// is then read back through `StorageManager::read_large_message_body`.
pub struct LargeMessageWriter {
    message: Message,
    path: PathBuf,
    file: File,
    written: u64,
}

impl LargeMessageWriter {
    pub(crate) fn create(directory: &Path, message: Message) -> Result<Self> {
        fs::create_dir_all(directory)?;
        let path = large_message_path(directory, message.id());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            message,
            path,
            file,
            written: 0,
        })
    }

    pub fn message_id(&self) -> u64 {
        self.message.id()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn add_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn seal(mut self) -> Result<Message> {
        self.file.flush()?;
        self.file.sync_all()?;
        let mut message = self.message;
        message.mark_large(self.written);
        Ok(message)
    }

    /// Abandon the body and remove its file.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

pub(crate) fn read_body(directory: &Path, message_id: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    File::open(large_message_path(directory, message_id))?.read_to_end(&mut body)?;
    Ok(body)
}

/// Remove a body file; a missing file is not an error.
pub(crate) fn delete_body(directory: &Path, message_id: u64) -> Result<()> {
    match fs::remove_file(large_message_path(directory, message_id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
