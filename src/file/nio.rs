use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::file::{list_with_extension, SequentialFile, SequentialFileFactory};
use crate::{Error, Result};

const FILL_CHUNK: usize = 64 * 1024;

/// Positional I/O over a plain `std::fs::File`. Grows on demand.
pub struct NioSequentialFile {
    name: String,
    path: PathBuf,
    file: Option<File>,
    position: u64,
}

impl NioSequentialFile {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(name),
            file: None,
            position: 0,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or(Error::Unsupported("sequential file is not open"))
    }
}

impl SequentialFile for NioSequentialFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;
            self.file = Some(file);
            self.position = 0;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn fill(&mut self, position: u64, len: u64) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        let zeros = vec![0u8; FILL_CHUNK];
        let mut left = len;
        while left > 0 {
            let n = left.min(FILL_CHUNK as u64) as usize;
            file.write_all(&zeros[..n])?;
            left -= n as u64;
        }
        file.sync_data()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        let position = self.position;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(bytes)?;
        if sync {
            file.sync_data()?;
        }
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let position = self.position;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.position += total as u64;
        Ok(total)
    }

    fn sync(&mut self) -> Result<()> {
        self.file_mut()?.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Factory for `NioSequentialFile`s in one directory.
#[derive(Debug, Clone)]
pub struct NioSequentialFileFactory {
    dir: PathBuf,
}

impl NioSequentialFileFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SequentialFileFactory for NioSequentialFileFactory {
    fn create_file(&self, name: &str) -> Box<dyn SequentialFile> {
        Box::new(NioSequentialFile::new(&self.dir, name))
    }

    fn list_files(&self, extension: &str) -> Result<Vec<String>> {
        list_with_extension(&self.dir, extension)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn directory(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_at_positions() {
        let dir = TempDir::new().unwrap();
        let factory = NioSequentialFileFactory::new(dir.path());
        let mut file = factory.create_file("one.dat");
        file.open().unwrap();
        file.fill(0, 1024).unwrap();
        assert_eq!(file.size().unwrap(), 1024);

        file.set_position(100).unwrap();
        file.write(b"hello", true).unwrap();
        assert_eq!(file.position(), 105);

        file.set_position(100).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        file.close().unwrap();

        let mut reopened = factory.create_file("one.dat");
        reopened.open().unwrap();
        reopened.set_position(100).unwrap();
        let mut buf = [0u8; 5];
        reopened.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn delete_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let factory = NioSequentialFileFactory::new(dir.path());
        factory.delete_file("nope.dat").unwrap();
    }

    #[test]
    fn ensure_directory_respects_flag() {
        let dir = TempDir::new().unwrap();
        let factory = NioSequentialFileFactory::new(dir.path().join("a/b"));
        assert!(matches!(
            factory.ensure_directory(false),
            Err(Error::Config(_))
        ));
        factory.ensure_directory(true).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
