//! Mutable state of one file transfer.
//!
//! A [Transaction] is owned by exactly one [crate::machine::Machine]. The kernel only looks
//! machines up by [TransactionId].
use std::{fs::File, path::PathBuf};

use spacepackets::{
    cfdp::{ChecksumType, ConditionCode, TransmissionMode},
    util::UnsignedByteField,
};

use crate::{
    checksum::FileChecksum,
    pdu::{DeliveryCode, FileStatus},
    EntityType, TransactionId,
};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TransactionFlags {
    pub cancelled: bool,
    pub suspended: bool,
    pub frozen: bool,
    pub finished: bool,
    pub abandoned: bool,
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    role: EntityType,
    remote_id: UnsignedByteField,
    pub trans_mode: TransmissionMode,
    pub checksum_type: ChecksumType,
    pub closure_requested: bool,
    pub flags: TransactionFlags,
    pub delivery_code: DeliveryCode,
    pub condition_code: ConditionCode,
    pub file_status: FileStatus,
    pub src_file_name: String,
    pub dest_file_name: String,
    /// Resolved path of the file inside the filestore. [None] for metadata only transactions.
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    /// Sender: file cursor. Receiver: end of the highest received segment.
    pub progress: u64,
    pub checksum: Option<FileChecksum>,
    pub file: Option<File>,
    /// Number of events which had no transition in the state they arrived in.
    pub anomalies: u32,
}

impl Transaction {
    pub fn new(id: TransactionId, role: EntityType, remote_id: UnsignedByteField) -> Self {
        Self {
            id,
            role,
            remote_id,
            trans_mode: TransmissionMode::Unacknowledged,
            checksum_type: ChecksumType::NullChecksum,
            closure_requested: false,
            flags: TransactionFlags::default(),
            delivery_code: DeliveryCode::Incomplete,
            condition_code: ConditionCode::NoError,
            file_status: FileStatus::Unreported,
            src_file_name: String::new(),
            dest_file_name: String::new(),
            file_path: None,
            file_size: 0,
            progress: 0,
            checksum: None,
            file: None,
            anomalies: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn role(&self) -> EntityType {
        self.role
    }

    /// The entity at the other end of the transaction.
    pub fn remote_id(&self) -> UnsignedByteField {
        self.remote_id
    }

    /// Neither finished nor abandoned.
    pub fn is_active(&self) -> bool {
        !self.flags.finished && !self.flags.abandoned
    }

    /// Suspended or frozen transactions do not make progress on ticks.
    pub fn is_halted(&self) -> bool {
        self.flags.suspended || self.flags.frozen
    }

    pub fn is_file_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn close_file(&mut self) {
        self.file = None;
    }

    pub fn record_anomaly(&mut self) {
        self.anomalies = self.anomalies.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::util::UnsignedByteFieldU16;

    use super::*;
    use crate::tests::{LOCAL_ID, REMOTE_ID};

    fn transaction() -> Transaction {
        Transaction::new(
            TransactionId::new(LOCAL_ID.into(), UnsignedByteFieldU16::new(1).into()),
            EntityType::Sending,
            REMOTE_ID.into(),
        )
    }

    #[test]
    fn test_new_transaction_state() {
        let transaction = transaction();
        assert!(transaction.is_active());
        assert!(!transaction.is_halted());
        assert!(!transaction.is_file_open());
        assert_eq!(transaction.role(), EntityType::Sending);
        assert_eq!(transaction.remote_id(), REMOTE_ID.into());
        assert_eq!(transaction.condition_code, ConditionCode::NoError);
        assert_eq!(transaction.delivery_code, DeliveryCode::Incomplete);
        assert_eq!(transaction.anomalies, 0);
    }

    #[test]
    fn test_flags() {
        let mut transaction = transaction();
        transaction.flags.frozen = true;
        assert!(transaction.is_halted());
        transaction.flags.frozen = false;
        transaction.flags.suspended = true;
        assert!(transaction.is_halted());
        transaction.flags.abandoned = true;
        assert!(!transaction.is_active());
        transaction.record_anomaly();
        transaction.record_anomaly();
        assert_eq!(transaction.anomalies, 2);
    }
}
