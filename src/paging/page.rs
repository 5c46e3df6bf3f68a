use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::codec::{self, Reader};
use crate::message::Message;
use crate::{Error, Result};

pub(crate) const PAGE_EXTENSION: &str = "page";

/// len (u32) + crc (u32)
const ENTRY_HEADER: usize = 8;

/// A message written to a page file, with the transaction that paged it
/// (0 outside a transaction).
#[derive(Debug, Clone)]
pub struct PagedMessage {
    pub tx_id: u64,
    /// Milliseconds since the epoch; 0 when not scheduled.
    pub scheduled_delivery_time: u64,
    pub message: Message,
}

impl PagedMessage {
    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.message.encode_size());
        codec::put_u64(&mut buf, self.tx_id);
        codec::put_u64(&mut buf, self.scheduled_delivery_time);
        buf.extend_from_slice(&self.message.encode());
        buf
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let tx_id = reader.u64()?;
        let scheduled_delivery_time = reader.u64()?;
        let message = Message::decode_from(&mut reader)?;
        Ok(Self {
            tx_id,
            scheduled_delivery_time,
            message,
        })
    }
}

pub(crate) fn page_path(directory: &Path, page_id: u32) -> PathBuf {
    directory.join(format!("{page_id:09}.{PAGE_EXTENSION}"))
}

/// Page ids found in `directory`, ascending.
pub(crate) fn list_pages(directory: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PAGE_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// An append-only page file.
///
/// Entries are `len | crc32 | tx_id | scheduled time | message`, where the
/// CRC covers everything after it.
pub(crate) struct Page {
    id: u32,
    file: File,
    size: u64,
}

impl Page {
    pub fn open(directory: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(page_path(directory, id))?;
        let size = file.metadata()?.len();
        Ok(Self { id, file, size })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the bytes written.
    pub fn write(&mut self, entry: &PagedMessage) -> Result<usize> {
        let payload = entry.encode_payload();
        let len = u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge)?;
        let mut buf = Vec::with_capacity(ENTRY_HEADER + payload.len());
        codec::put_u32(&mut buf, len);
        codec::put_u32(&mut buf, crc32fast::hash(&payload));
        buf.extend_from_slice(&payload);
        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Read every intact entry of a page. A torn or corrupt tail ends the read.
pub(crate) fn read_page(directory: &Path, page_id: u32) -> Result<Vec<PagedMessage>> {
    let path = page_path(directory, page_id);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + ENTRY_HEADER <= bytes.len() {
        let mut header = Reader::new(&bytes[pos..pos + ENTRY_HEADER]);
        let len = header.u32()? as usize;
        let crc = header.u32()?;
        let start = pos + ENTRY_HEADER;
        let Some(payload) = bytes.get(start..start + len) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        entries.push(PagedMessage::decode_payload(payload)?);
        pos = start + len;
    }
    if pos != bytes.len() {
        warn!(
            "ignoring {} trailing bytes in page {}",
            bytes.len() - pos,
            path.display()
        );
    }
    Ok(entries)
}

pub(crate) fn delete_page(directory: &Path, page_id: u32) -> Result<()> {
    match fs::remove_file(page_path(directory, page_id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
