//! On-disk layout of journal files.
//!
//! ```text
//! file   := header(64) record* zero-padding
//! header := magic u32 | version u32 | file_id u32 | pad[52]
//! record := type u8 | file_id u32 | tx_id u64 | id u64 | user_type u8
//!           | body_len u32 | body | crc32 u32
//! ```
//!
//! All integers are little-endian. The CRC covers every byte of the record
//! before it. A record whose `file_id` differs from the header belongs to a
//! previous use of a recycled file and marks the end of live data.

use crate::file::SequentialFile;
use crate::{Error, Result};

/// Journal file magic ('CJRN').
pub const JOURNAL_MAGIC: u32 = 0x434A_524E;

pub const JOURNAL_VERSION: u32 = 1;

pub const FILE_HEADER_SIZE: usize = 64;

/// Fixed bytes around a record body.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + 4;

const RECORD_HEADER_SIZE: usize = 1 + 4 + 8 + 8 + 1 + 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Add = 11,
    Update = 12,
    AddTx = 13,
    UpdateTx = 14,
    DeleteTx = 15,
    Delete = 16,
    Prepare = 17,
    Commit = 18,
    Rollback = 19,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            11 => RecordType::Add,
            12 => RecordType::Update,
            13 => RecordType::AddTx,
            14 => RecordType::UpdateTx,
            15 => RecordType::DeleteTx,
            16 => RecordType::Delete,
            17 => RecordType::Prepare,
            18 => RecordType::Commit,
            19 => RecordType::Rollback,
            _ => return None,
        })
    }

    pub fn is_transactional(self) -> bool {
        !matches!(self, RecordType::Add | RecordType::Update | RecordType::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub file_id: u32,
}

impl FileHeader {
    pub fn new(file_id: u32) -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            file_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.file_id.to_le_bytes());
        buf
    }

    /// Parse a header, returning `None` for a file that was never
    /// initialised.
    pub fn from_bytes(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < FILE_HEADER_SIZE {
            return Ok(None);
        }
        let magic = read_u32(buf, 0);
        if magic == 0 {
            return Ok(None);
        }
        if magic != JOURNAL_MAGIC {
            return Err(Error::Corrupt("bad journal file magic"));
        }
        let version = read_u32(buf, 4);
        if version != JOURNAL_VERSION {
            return Err(Error::Unsupported("journal file version"));
        }
        Ok(Some(Self {
            magic,
            version,
            file_id: read_u32(buf, 8),
        }))
    }
}

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub record_type: RecordType,
    pub file_id: u32,
    pub tx_id: u64,
    pub id: u64,
    pub user_type: u8,
    pub body: Vec<u8>,
}

impl RawRecord {
    pub fn encoded_len(body_len: usize) -> usize {
        RECORD_OVERHEAD + body_len
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_record(
            self.record_type,
            self.file_id,
            self.tx_id,
            self.id,
            self.user_type,
            &self.body,
        )
    }
}

pub fn encode_record(
    record_type: RecordType,
    file_id: u32,
    tx_id: u64,
    id: u64,
    user_type: u8,
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + body.len());
    buf.push(record_type as u8);
    buf.extend_from_slice(&file_id.to_le_bytes());
    buf.extend_from_slice(&tx_id.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.push(user_type);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Why a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// Zeroed space or the physical end of the file.
    Clean,
    /// A record left over from a previous use of the file.
    Stale,
    /// A partially written record.
    Torn,
}

/// Everything readable from one journal file.
#[derive(Debug)]
pub struct ScannedFile {
    pub header: Option<FileHeader>,
    pub records: Vec<RawRecord>,
    /// Offset just past the last valid record.
    pub end_offset: u64,
    pub end: ScanEnd,
    pub size: u64,
}

/// Read a whole journal file and decode its live records.
pub fn scan_file(file: &mut dyn SequentialFile) -> Result<ScannedFile> {
    let size = file.size()?;
    let mut data = vec![0u8; size as usize];
    file.set_position(0)?;
    let read = file.read(&mut data)?;
    data.truncate(read);

    let header = FileHeader::from_bytes(&data)?;
    let Some(header) = header else {
        return Ok(ScannedFile {
            header: None,
            records: Vec::new(),
            end_offset: FILE_HEADER_SIZE as u64,
            end: ScanEnd::Clean,
            size,
        });
    };

    let mut records = Vec::new();
    let mut pos = FILE_HEADER_SIZE;
    let end = loop {
        if pos + RECORD_OVERHEAD > data.len() {
            break if data[pos..].iter().all(|b| *b == 0) {
                ScanEnd::Clean
            } else {
                ScanEnd::Torn
            };
        }
        let type_byte = data[pos];
        if type_byte == 0 {
            break ScanEnd::Clean;
        }
        let file_id = read_u32(&data, pos + 1);
        if file_id != header.file_id {
            break ScanEnd::Stale;
        }
        let Some(record_type) = RecordType::from_u8(type_byte) else {
            break ScanEnd::Torn;
        };
        let body_len = read_u32(&data, pos + 22) as usize;
        let total = RECORD_OVERHEAD + body_len;
        if pos + total > data.len() {
            break ScanEnd::Torn;
        }
        let crc_at = pos + RECORD_HEADER_SIZE + body_len;
        let expected = read_u32(&data, crc_at);
        if crc32fast::hash(&data[pos..crc_at]) != expected {
            break ScanEnd::Torn;
        }
        records.push(RawRecord {
            record_type,
            file_id,
            tx_id: read_u64(&data, pos + 5),
            id: read_u64(&data, pos + 13),
            user_type: data[pos + 21],
            body: data[pos + RECORD_HEADER_SIZE..crc_at].to_vec(),
        });
        pos += total;
    };

    Ok(ScannedFile {
        header: Some(header),
        records,
        end_offset: pos as u64,
        end,
        size,
    })
}

/// Per-file record counts carried by prepare and commit records, followed by
/// caller data (the encoded xid for prepares).
pub fn encode_tx_summary(counts: &[(u32, u32)], extra: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + counts.len() * 8 + extra.len());
    buf.extend_from_slice(&(counts.len() as u32).to_le_bytes());
    for (file_id, count) in counts {
        buf.extend_from_slice(&file_id.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
    }
    buf.extend_from_slice(extra);
    buf
}

pub fn decode_tx_summary(body: &[u8]) -> Result<(Vec<(u32, u32)>, Vec<u8>)> {
    if body.len() < 4 {
        return Err(Error::Corrupt("transaction summary truncated"));
    }
    let n = read_u32(body, 0) as usize;
    let counts_end = n
        .checked_mul(8)
        .and_then(|len| len.checked_add(4))
        .ok_or(Error::Corrupt("transaction summary overflow"))?;
    if counts_end > body.len() {
        return Err(Error::Corrupt("transaction summary truncated"));
    }
    let counts = (0..n)
        .map(|i| {
            let at = 4 + i * 8;
            (read_u32(body, at), read_u32(body, at + 4))
        })
        .collect();
    Ok((counts, body[counts_end..].to_vec()))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
