use std::fmt;

use crate::codec::{self, Reader};
use crate::Result;

/// Global transaction identifier for two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            12 + self.global_transaction_id.len() + self.branch_qualifier.len(),
        );
        codec::put_i32(&mut buf, self.format_id);
        codec::put_bytes(&mut buf, &self.global_transaction_id);
        codec::put_bytes(&mut buf, &self.branch_qualifier);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(Self {
            format_id: reader.i32()?,
            global_transaction_id: reader.bytes()?,
            branch_qualifier: reader.bytes()?,
        })
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for byte in &self.global_transaction_id {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(":")?;
        for byte in &self.branch_qualifier {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_hex() {
        let xid = Xid::new(3, vec![0xab, 0x01], vec![0xff]);
        assert_eq!(xid.to_string(), "3:ab01:ff");
        assert_eq!(Xid::decode(&xid.encode()).unwrap(), xid);
    }

    #[test]
    fn truncated_xid_is_corrupt() {
        let xid = Xid::new(1, b"gtx".to_vec(), b"bq".to_vec());
        let bytes = xid.encode();
        assert!(Xid::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
