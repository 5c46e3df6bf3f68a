//! Reference counting that decides when a journal file holds no live data.
//!
//! Every record that keeps data alive adds a positive to the file it sits
//! in; every record that retires data (a delete, a commit or rollback
//! closing a transaction) adds a negative, in its own file, against the
//! file holding the retired data. Positives are never decremented, so a
//! file is reclaimable once the negatives recorded against it across itself
//! and all later files cover its positives, and none of its own negatives
//! point at an earlier file that must be kept (dropping them would revive
//! that file's data on replay).

use std::collections::HashMap;

/// Accounting for one journal file.
#[derive(Debug, Clone)]
pub struct JournalFile {
    pub name: String,
    pub file_id: u32,
    pos_count: u32,
    neg_counts: HashMap<u32, u32>,
    can_reclaim: bool,
}

impl JournalFile {
    pub fn new(name: impl Into<String>, file_id: u32) -> Self {
        Self {
            name: name.into(),
            file_id,
            pos_count: 0,
            neg_counts: HashMap::new(),
            can_reclaim: false,
        }
    }

    pub fn pos_count(&self) -> u32 {
        self.pos_count
    }

    pub fn inc_pos(&mut self) {
        self.pos_count += 1;
    }

    pub fn dec_pos(&mut self) {
        self.pos_count = self.pos_count.saturating_sub(1);
    }

    pub fn inc_neg(&mut self, against: u32) {
        *self.neg_counts.entry(against).or_insert(0) += 1;
    }

    pub fn neg_count(&self, against: u32) -> u32 {
        self.neg_counts.get(&against).copied().unwrap_or(0)
    }

    pub fn can_reclaim(&self) -> bool {
        self.can_reclaim
    }

    /// Reset for reuse under a new order id.
    pub fn recycle(&mut self, file_id: u32) {
        self.file_id = file_id;
        self.pos_count = 0;
        self.neg_counts.clear();
        self.can_reclaim = false;
    }
}

/// Recompute `can_reclaim` for `files`, ordered oldest first.
pub fn scan(files: &mut [JournalFile]) {
    for i in 0..files.len() {
        let id = files[i].file_id;
        let total_neg: u32 = files[i..].iter().map(|f| f.neg_count(id)).sum();
        let mut can = total_neg >= files[i].pos_count;
        if can {
            for j in 0..i {
                if !files[j].can_reclaim && files[i].neg_count(files[j].file_id) != 0 {
                    can = false;
                    break;
                }
            }
        }
        files[i].can_reclaim = can;
    }
}
