//! This crate contains a CCSDS File Delivery Protocol (CFDP) transaction engine as specified in
//! CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). This crate implements the unacknowledged mode (Class 1) for both the sending
//! and the receiving side. The engine multiplexes an arbitrary number of simultaneous
//! transactions over one transport.
//!
//! The main components, leaves first:
//!
//! - [pdu]: binary wire format of all PDUs with exact encode and decode contracts.
//! - [timer]: restartable countdown with running, paused and off states, used for inactivity
//!   detection.
//! - [mib]: the management information base which stores the local entity configuration and
//!   one [mib::RemoteEntityConfig] per remote entity, created with documented defaults on
//!   first lookup.
//! - [transaction] and [machine]: the state of one file transfer and the state machine driving
//!   it, with the variants [machine::Sender1] and [machine::Receiver1].
//! - [request]: typed user requests (Put, Report, Cancel, Suspend, Resume).
//! - [kernel]: the [kernel::Kernel] which owns the transaction table and the inbound and
//!   outbound PDU queues, routes PDUs and requests and ticks all machines.
//! - [scheduler]: runs the kernel loops on dedicated threads.
//! - [transport]: adapters between raw PDU byte buffers and a concrete transport, including
//!   the PDU-per-file [transport::DirectoryTransport].
//!
//! # Examples
//!
//! The [end-to-end test](tests/end-to-end.rs) spawns two engines on separate threads, links them
//! through channels and performs a file copy operation. You can run it with console printout
//! by running:
//!
//! ```sh
//! cargo test end_to_end_test -- --nocapture
//! ```
//!
//! The directory relay demo runs one engine which exchanges PDUs with a peer through two
//! directories, one file per PDU:
//!
//! ```sh
//! cargo run --example directory-relay -- --help
//! ```
//!
//! # Notes on the user hooks and scheduling
//!
//! The [user::CfdpUser] trait receives all CFDP indications, and the [UserFaultHook] trait is
//! called for each declared fault. Both are owned by the kernel. The kernel itself is not
//! thread-safe: [scheduler::spawn_engine] wraps it into a mutex so that at most one machine
//! step is executed at a time.
use core::{cell::RefCell, fmt::Display, hash::Hash};

use spacepackets::{
    cfdp::{ConditionCode, FaultHandlerCode, PduType},
    util::{UnsignedByteField, UnsignedEnum},
    ByteConversionError,
};

pub mod checksum;
pub mod filestore;
pub mod kernel;
pub mod machine;
pub mod mib;
pub mod pdu;
pub mod request;
pub mod scheduler;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod user;

use pdu::{CommonPduConfig, FileDirectiveType, Pdu, PduError, PduHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Sending,
    Receiving,
}

/// This trait introduces some callbacks which will be called when a particular CFDP fault
/// handler is called.
///
/// It is passed into the kernel as part of the [FaultHandler] and provides a way to specify
/// custom user error handlers. This allows to implement some CFDP features like fault handler
/// logging, which would not be possible generically otherwise.
///
/// For each error reported by the [FaultHandler], the appropriate fault handler callback
/// will be called depending on the [FaultHandlerCode].
pub trait UserFaultHook {
    fn notice_of_suspension_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    );

    fn notice_of_cancellation_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    );

    fn abandoned_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64);

    fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64);
}

/// Fault hook which only logs the reported faults.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct LoggingFaultHook {}

impl UserFaultHook for LoggingFaultHook {
    fn notice_of_suspension_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        log::warn!(
            "transaction {transaction_id} suspended by fault {cond:?} at progress {progress}"
        );
    }

    fn notice_of_cancellation_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        log::warn!(
            "transaction {transaction_id} cancelled by fault {cond:?} at progress {progress}"
        );
    }

    fn abandoned_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        log::error!(
            "transaction {transaction_id} abandoned by fault {cond:?} at progress {progress}"
        );
    }

    fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        log::info!(
            "ignored fault {cond:?} for transaction {transaction_id} at progress {progress}"
        );
    }
}

/// This structure is used to implement the fault handling as specified in chapter 4.8 of the CFDP
/// standard.
///
/// It does so by mapping each applicable [ConditionCode] to a fault handler which is denoted by
/// the four [FaultHandlerCode]s. This code is used to select the error handling inside the
/// machines in addition to dispatching to a user-provided callback function provided by the
/// [UserFaultHook].
///
/// Some note on the provided default settings:
///
/// - Checksum failures will be ignored by default. The transaction still finishes, but with an
///   incomplete delivery code.
/// - Unsupported checksum types will also be ignored by default. Even if the checksum type is
///   not supported the file transfer might still have worked properly.
///
/// For all other faults, the default fault handling operation will be to cancel the transaction.
/// These defaults can be overriden by using the [Self::set_fault_handler] method.
pub struct FaultHandler<Hook: UserFaultHook> {
    handler_array: [FaultHandlerCode; 10],
    pub user_hook: RefCell<Hook>,
}

impl<Hook: UserFaultHook> FaultHandler<Hook> {
    fn condition_code_to_array_index(condition_code: ConditionCode) -> Option<usize> {
        Some(match condition_code {
            ConditionCode::PositiveAckLimitReached => 0,
            ConditionCode::KeepAliveLimitReached => 1,
            ConditionCode::InvalidTransmissionMode => 2,
            ConditionCode::FilestoreRejection => 3,
            ConditionCode::FileChecksumFailure => 4,
            ConditionCode::FileSizeError => 5,
            ConditionCode::NakLimitReached => 6,
            ConditionCode::InactivityDetected => 7,
            ConditionCode::CheckLimitReached => 8,
            ConditionCode::UnsupportedChecksumType => 9,
            _ => return None,
        })
    }

    pub fn new(user_hook: Hook) -> Self {
        let mut handler_array = [FaultHandlerCode::NoticeOfCancellation; 10];
        for ignored in [
            ConditionCode::FileChecksumFailure,
            ConditionCode::UnsupportedChecksumType,
        ] {
            if let Some(idx) = Self::condition_code_to_array_index(ignored) {
                handler_array[idx] = FaultHandlerCode::IgnoreError;
            }
        }
        Self {
            handler_array,
            user_hook: RefCell::new(user_hook),
        }
    }

    /// Overrides the handler for one fault condition. Returns [false] if the condition code is
    /// not a fault condition.
    pub fn set_fault_handler(
        &mut self,
        condition_code: ConditionCode,
        fault_handler: FaultHandlerCode,
    ) -> bool {
        match Self::condition_code_to_array_index(condition_code) {
            Some(idx) => {
                self.handler_array[idx] = fault_handler;
                true
            }
            None => false,
        }
    }

    pub fn get_fault_handler(&self, condition_code: ConditionCode) -> FaultHandlerCode {
        Self::condition_code_to_array_index(condition_code)
            .map(|idx| self.handler_array[idx])
            .unwrap_or(FaultHandlerCode::IgnoreError)
    }

    /// Calls the user hook and returns the handler the machine has to apply.
    pub fn report_fault(
        &self,
        transaction_id: TransactionId,
        condition: ConditionCode,
        progress: u64,
    ) -> FaultHandlerCode {
        let fh_code = match Self::condition_code_to_array_index(condition) {
            Some(idx) => self.handler_array[idx],
            None => return FaultHandlerCode::IgnoreError,
        };
        let mut handler_mut = self.user_hook.borrow_mut();
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                handler_mut.notice_of_cancellation_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::NoticeOfSuspension => {
                handler_mut.notice_of_suspension_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::IgnoreError => {
                handler_mut.ignore_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::AbandonTransaction => {
                handler_mut.abandoned_cb(transaction_id, condition, progress);
            }
        }
        fh_code
    }
}

/// Generic error type for sending a PDU via a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
    #[error("queue is full, fill count {0:?}")]
    QueueFull(Option<u32>),
    #[error("other send error")]
    Other,
}

/// Sink for all PDUs generated by the machines. The kernel uses the sending half of its
/// outbound queue.
pub trait PduSender {
    fn send_pdu(
        &self,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;
}

mod std_mod {
    use std::sync::mpsc;

    use super::*;

    impl PduSender for mpsc::Sender<PduOwnedWithInfo> {
        fn send_pdu(
            &self,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.send(PduOwnedWithInfo::new(
                pdu_type,
                file_directive_type,
                raw_pdu.to_vec(),
            ))
            .map_err(|_| GenericSendError::RxDisconnected)?;
            Ok(())
        }
    }

    impl PduSender for mpsc::SyncSender<PduOwnedWithInfo> {
        fn send_pdu(
            &self,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.try_send(PduOwnedWithInfo::new(
                pdu_type,
                file_directive_type,
                raw_pdu.to_vec(),
            ))
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => GenericSendError::QueueFull(None),
                mpsc::TrySendError::Disconnected(_) => GenericSendError::RxDisconnected,
            })
        }
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the sequence
/// number of that transfer which is also determined by the CFDP source entity.
///
/// Equality and hashing only consider the values, not the widths of the two fields.
#[derive(Debug, Eq, Copy, Clone)]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl From<&CommonPduConfig> for TransactionId {
    fn from(conf: &CommonPduConfig) -> Self {
        Self::new(conf.source_id(), conf.transaction_seq_num)
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source_id.value(), self.seq_num.value())
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

/// Raw PDU together with the routing information extracted from it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PduOwnedWithInfo {
    pub pdu_type: PduType,
    pub file_directive_type: Option<FileDirectiveType>,
    pub pdu: Vec<u8>,
}

impl PduOwnedWithInfo {
    pub fn new(
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        pdu: Vec<u8>,
    ) -> Self {
        Self {
            pdu_type,
            file_directive_type,
            pdu,
        }
    }

    pub fn new_from_pdu(pdu: &Pdu) -> Self {
        Self::new(pdu.pdu_type(), pdu.file_directive_type(), pdu.to_vec())
    }

    /// Only inspects the header and the directive code.
    pub fn new_from_raw_packet(raw_packet: &[u8]) -> Result<Self, PduError> {
        let (header, header_len) = PduHeader::from_bytes(raw_packet)?;
        if raw_packet.len() < header.pdu_len() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: raw_packet.len(),
                expected: header.pdu_len(),
            }
            .into());
        }
        let file_directive_type = match header.pdu_type() {
            PduType::FileData => None,
            PduType::FileDirective => {
                if header.pdu_datafield_len() < 1 {
                    return Err(PduError::FormatError);
                }
                let raw_directive = raw_packet[header_len];
                Some(FileDirectiveType::try_from(raw_directive).map_err(|_| {
                    PduError::InvalidDirectiveType {
                        found: raw_directive,
                        expected: None,
                    }
                })?)
            }
        };
        Ok(Self::new(
            header.pdu_type(),
            file_directive_type,
            raw_packet[..header.pdu_len()].to_vec(),
        ))
    }

    pub fn header(&self) -> Result<PduHeader, PduError> {
        Ok(PduHeader::from_bytes(&self.pdu)?.0)
    }

    /// ID of the entity this PDU is addressed to: the destination entity ID for PDUs towards
    /// the file receiver, the source entity ID otherwise.
    pub fn receiving_entity_id(&self) -> Result<UnsignedByteField, PduError> {
        let header = self.header()?;
        let conf = header.common_pdu_conf();
        Ok(match conf.direction {
            spacepackets::cfdp::Direction::TowardsReceiver => conf.dest_id(),
            spacepackets::cfdp::Direction::TowardsSender => conf.source_id(),
        })
    }
}
