//! User requests.
//!
//! A [Request] is the typed form of a user operation. The kernel validates it, maps it to an
//! [crate::machine::Event] and delivers it to the responsible machine.
use spacepackets::{cfdp::TransmissionMode, util::UnsignedByteField};

use crate::{
    filestore::{is_relative_path_inside_root, FilestoreError},
    pdu::PduError,
    GenericSendError, TransactionId,
};

/// Reason why a request was rejected. A rejected request never changes the state of an
/// existing transaction and never creates one.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    #[error("file path {0:?} is not a relative path inside the filestore root")]
    PathNotRelative(String),
    #[error("file path too large: {0} bytes, at most 255 bytes allowed")]
    FilePathTooLarge(usize),
    #[error("source file {0:?} does not exist")]
    SourceFileMissing(String),
    #[error("no active transaction with ID {0}")]
    InvalidTransaction(TransactionId),
    #[error("transmission mode {0:?} is not supported")]
    UnsupportedTransmissionMode(TransmissionMode),
    #[error("destination entity ID width {found} does not match local entity ID width {expected}")]
    EntityIdWidthMismatch { expected: usize, found: usize },
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("send error: {0}")]
    Send(#[from] GenericSendError),
}

/// Checks performed on the file names of each put request before any transaction state is
/// created.
pub fn generic_path_checks(source_file: &str, dest_file: &str) -> Result<(), RequestError> {
    for path in [source_file, dest_file] {
        if path.len() > u8::MAX as usize {
            return Err(RequestError::FilePathTooLarge(path.len()));
        }
        if !is_relative_path_inside_root(path) {
            return Err(RequestError::PathNotRelative(path.to_string()));
        }
    }
    Ok(())
}

/// Put request which initiates the transfer of one file to a remote entity.
///
/// Unset optional fields are resolved from the [crate::mib::RemoteEntityConfig] of the
/// destination entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub destination_id: UnsignedByteField,
    pub source_file: String,
    pub dest_file: String,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
}

impl PutRequest {
    pub fn new_regular_request(
        dest_id: impl Into<UnsignedByteField>,
        source_file: &str,
        dest_file: &str,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, RequestError> {
        generic_path_checks(source_file, dest_file)?;
        Ok(Self {
            destination_id: dest_id.into(),
            source_file: source_file.to_string(),
            dest_file: dest_file.to_string(),
            trans_mode,
            closure_requested,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put(PutRequest),
    Report(TransactionId),
    Cancel(TransactionId),
    Suspend(TransactionId),
    Resume(TransactionId),
}

impl Request {
    /// ID of the addressed transaction. [None] for put requests.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Request::Put(_) => None,
            Request::Report(id)
            | Request::Cancel(id)
            | Request::Suspend(id)
            | Request::Resume(id) => Some(*id),
        }
    }
}
