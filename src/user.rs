//! CFDP user interface.
//!
//! The [CfdpUser] receives all indications defined in chapter 3.5 of the CFDP standard. The
//! optional indications are only issued if the matching flag of the
//! [crate::mib::IndicationConfig] is set.
use derive_new::new;
use spacepackets::{cfdp::ConditionCode, util::UnsignedByteField};

use crate::{
    machine::State,
    pdu::{DeliveryCode, FileStatus},
    transaction::TransactionFlags,
    EntityType, TransactionId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

#[derive(Debug, new)]
pub struct MetadataReceivedParams<'src_file, 'dest_file> {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: &'src_file str,
    pub dest_file_name: &'dest_file str,
}

#[derive(Debug, new)]
pub struct FileSegmentRecvdParams<'seg_meta> {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub segment_metadata: Option<&'seg_meta [u8]>,
}

/// Snapshot of a transaction, passed to [CfdpUser::report_indication] and returned by
/// [crate::kernel::Kernel::report].
#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
pub struct TransactionReport {
    pub id: TransactionId,
    pub role: EntityType,
    pub state: State,
    pub flags: TransactionFlags,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub progress: u64,
    pub file_size: u64,
    pub anomalies: u32,
}

pub trait CfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId);

    fn eof_sent_indication(&mut self, id: &TransactionId);

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams);

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams);

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams);

    fn report_indication(&mut self, report: &TransactionReport);

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode);

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64);

    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );

    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );

    fn eof_recvd_indication(&mut self, id: &TransactionId);
}

/// User which logs every indication.
#[derive(Debug, Default, Copy, Clone)]
pub struct LoggingUser {}

impl CfdpUser for LoggingUser {
    fn transaction_indication(&mut self, id: &TransactionId) {
        log::info!("transaction {id} started");
    }

    fn eof_sent_indication(&mut self, id: &TransactionId) {
        log::info!("EOF sent for transaction {id}");
    }

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
        log::info!(
            "transaction {} finished: {:?}, {:?}, {:?}",
            finished_params.id,
            finished_params.condition_code,
            finished_params.delivery_code,
            finished_params.file_status
        );
    }

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
        log::info!(
            "metadata received for transaction {}: {} -> {}, {} bytes",
            md_recvd_params.id,
            md_recvd_params.src_file_name,
            md_recvd_params.dest_file_name,
            md_recvd_params.file_size
        );
    }

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams) {
        log::debug!(
            "segment received for transaction {}: offset {}, {} bytes",
            segment_recvd_params.id,
            segment_recvd_params.offset,
            segment_recvd_params.length
        );
    }

    fn report_indication(&mut self, report: &TransactionReport) {
        log::info!("report for transaction {}: {:?}", report.id, report);
    }

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode) {
        log::info!("transaction {id} suspended: {condition_code:?}");
    }

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64) {
        log::info!("transaction {id} resumed at progress {progress}");
    }

    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    ) {
        log::warn!("fault {condition_code:?} for transaction {id} at progress {progress}");
    }

    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    ) {
        log::warn!("transaction {id} abandoned: {condition_code:?} at progress {progress}");
    }

    fn eof_recvd_indication(&mut self, id: &TransactionId) {
        log::info!("EOF received for transaction {id}");
    }
}
