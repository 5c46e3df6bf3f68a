use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::file::{list_with_extension, SequentialFile, SequentialFileFactory};
use crate::{Error, Result};

/// The open state of a mapped file. The `File` is kept for `sync_all`.
struct Mapping {
    file: File,
    map: MmapMut,
}

impl Mapping {
    /// Map `path`, creating it at `size` bytes when it is missing or empty.
    fn open_or_create(path: &Path, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let mut len = file.metadata()?.len() as usize;
        if len == 0 {
            if size == 0 {
                return Err(Error::Unsupported("mapped file size must be non-zero"));
            }
            file.set_len(size as u64)?;
            len = size;
        }
        // The journal owns its directory; no other process truncates the
        // file while it is mapped.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map })
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn bounds(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(offset..end),
            _ => Err(Error::PayloadTooLarge),
        }
    }

    fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if len > 0 {
            self.map.flush_range(offset, len)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// A fixed-size file accessed through a shared mapping.
///
/// Writes past the mapped length fail; the journal never needs to grow a
/// file once it has been created at `journal_file_size`.
pub struct MappedSequentialFile {
    name: String,
    path: PathBuf,
    default_size: usize,
    mapping: Option<Mapping>,
    position: u64,
}

impl MappedSequentialFile {
    pub fn new(dir: &Path, name: &str, default_size: usize) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(name),
            default_size,
            mapping: None,
            position: 0,
        }
    }

    fn mapping(&mut self) -> Result<&mut Mapping> {
        self.mapping
            .as_mut()
            .ok_or(Error::Unsupported("mapped file is not open"))
    }
}

impl SequentialFile for MappedSequentialFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.mapping.is_none() {
            self.mapping = Some(Mapping::open_or_create(&self.path, self.default_size)?);
            self.position = 0;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    fn fill(&mut self, position: u64, len: u64) -> Result<()> {
        let mapping = self.mapping()?;
        let start = (position as usize).min(mapping.len());
        let end = position.saturating_add(len).min(mapping.len() as u64) as usize;
        mapping.map[start..end].fill(0);
        mapping.flush_range(start, end - start)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        let offset = self.position as usize;
        let mapping = self.mapping()?;
        let range = mapping.bounds(offset, bytes.len())?;
        mapping.map[range].copy_from_slice(bytes);
        if sync {
            mapping.flush_range(offset, bytes.len())?;
        }
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let offset = self.position as usize;
        let mapping = self.mapping()?;
        if offset >= mapping.len() {
            return Ok(0);
        }
        let n = buf.len().min(mapping.len() - offset);
        buf[..n].copy_from_slice(&mapping.map[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn sync(&mut self) -> Result<()> {
        self.mapping()?.sync()
    }

    fn size(&self) -> Result<u64> {
        match &self.mapping {
            Some(mapping) => Ok(mapping.len() as u64),
            None => match std::fs::metadata(&self.path) {
                Ok(meta) => Ok(meta.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(err) => Err(err.into()),
            },
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mapping) = self.mapping.take() {
            mapping.sync()?;
        }
        Ok(())
    }
}

/// Factory for `MappedSequentialFile`s of a fixed size.
#[derive(Debug, Clone)]
pub struct MappedSequentialFileFactory {
    dir: PathBuf,
    file_size: usize,
}

impl MappedSequentialFileFactory {
    pub fn new(dir: impl Into<PathBuf>, file_size: usize) -> Self {
        Self {
            dir: dir.into(),
            file_size,
        }
    }
}

impl SequentialFileFactory for MappedSequentialFileFactory {
    fn create_file(&self, name: &str) -> Box<dyn SequentialFile> {
        Box::new(MappedSequentialFile::new(&self.dir, name, self.file_size))
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
