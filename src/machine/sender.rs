//! Class 1 sending machine.
use std::io::{Read, Seek, SeekFrom};

use spacepackets::{
    cfdp::{
        lv::Lv, tlv::EntityIdTlv, ChecksumType, ConditionCode, CrcFlag, Direction,
        FaultHandlerCode, LargeFileFlag, TransmissionMode,
    },
    util::UnsignedByteField,
};

use super::{ignore_event, transaction_report, Event, MachineContext, MachineError, State};
use crate::{
    checksum::FileChecksum,
    filestore::VirtualFilestore,
    pdu::{
        CommonPduConfig, DeliveryCode, EofPdu, FileDataPdu, FileStatus, MetadataGenericParams,
        MetadataPduCreator, PduError, PduHeader,
    },
    request::PutRequest,
    timer::Timer,
    transaction::Transaction,
    user::CfdpUser,
    EntityType, PduSender, TransactionId, UserFaultHook,
};

/// Upper bound for the file data of one File Data PDU so the data field length always fits
/// the 16 bit header field.
pub const MAX_SEGMENT_LEN: usize = u16::MAX as usize - 16;

#[derive(Debug)]
pub struct Sender1 {
    state: State,
    transaction: Transaction,
    /// Header template of all PDUs of this transaction. Set by the put request.
    pdu_conf: Option<CommonPduConfig>,
    segment_len: usize,
    eof_pending: bool,
    inactivity_timer: Timer,
}

impl Sender1 {
    pub fn new(id: TransactionId, remote_id: UnsignedByteField) -> Self {
        Self {
            state: State::S1,
            transaction: Transaction::new(id, EntityType::Sending, remote_id),
            pdu_conf: None,
            segment_len: 0,
            eof_pending: false,
            inactivity_timer: Timer::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn inactivity_timer(&self) -> &Timer {
        &self.inactivity_timer
    }

    pub fn inactivity_timer_mut(&mut self) -> &mut Timer {
        &mut self.inactivity_timer
    }

    /// The whole file was read and the EOF PDU is due on the next directive tick.
    pub fn eof_pending(&self) -> bool {
        self.eof_pending
    }

    pub fn update_state<Vfs, User, Hook, Sender>(
        &mut self,
        event: Event,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        match (self.state, event) {
            (State::S1, Event::PutRequest(put_request)) => {
                self.handle_put_request(put_request, ctx)
            }
            (_, Event::ReportRequest) => {
                ctx.user
                    .report_indication(&transaction_report(&self.transaction, self.state));
                Ok(())
            }
            (State::S2, Event::SendFileDirective) => self.send_file_directive(ctx),
            (State::S2, Event::SendFileData) => self.send_file_data(ctx),
            (State::S2, Event::CancelRequest) => {
                self.cancel(ConditionCode::CancelRequestReceived, ctx)
            }
            (State::S2, Event::SuspendRequest) => {
                ctx.suspend(
                    &mut self.transaction,
                    &mut self.inactivity_timer,
                    ConditionCode::SuspendRequestReceived,
                );
                Ok(())
            }
            (State::S2, Event::ResumeRequest) => {
                ctx.resume(&mut self.transaction, &mut self.inactivity_timer);
                Ok(())
            }
            (_, Event::Freeze) => {
                ctx.freeze(&mut self.transaction, &mut self.inactivity_timer);
                Ok(())
            }
            (_, Event::Thaw) => {
                ctx.thaw(&mut self.transaction, &mut self.inactivity_timer);
                Ok(())
            }
            (state, event) => {
                ignore_event(&mut self.transaction, state, &event);
                Ok(())
            }
        }
    }

    fn handle_put_request<Vfs, User, Hook, Sender>(
        &mut self,
        put_request: PutRequest,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let source_path = ctx.vfs.outgoing_path(&put_request.source_file)?;
        let file_size = ctx.vfs.file_size(&source_path)?;
        let remote_cfg = ctx.mib.remote_config(self.transaction.remote_id()).clone();
        let checksum_type = if FileChecksum::is_supported(remote_cfg.default_crc_type) {
            remote_cfg.default_crc_type
        } else {
            log::warn!(
                "checksum type {:?} not supported, sending with null checksum",
                remote_cfg.default_crc_type
            );
            ChecksumType::NullChecksum
        };
        let closure_requested = put_request
            .closure_requested
            .unwrap_or(remote_cfg.closure_requested_by_default);
        let file_flag = if file_size > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        let crc_flag = if remote_cfg.crc_on_transmission_by_default {
            CrcFlag::WithCrc
        } else {
            CrcFlag::NoCrc
        };
        let pdu_conf = CommonPduConfig::new(
            ctx.mib.local_entity_id(),
            self.transaction.remote_id(),
            *self.transaction.id().seq_num(),
            TransmissionMode::Unacknowledged,
            file_flag,
            crc_flag,
            Direction::TowardsReceiver,
        )?;
        let src_file_name = Lv::new_from_str(&put_request.source_file)
            .map_err(|e| PduError::TlvLvError(e.into()))?;
        let dest_file_name = Lv::new_from_str(&put_request.dest_file)
            .map_err(|e| PduError::TlvLvError(e.into()))?;
        let metadata_pdu = MetadataPduCreator::new_no_opts(
            PduHeader::new_no_file_data(pdu_conf, 0),
            MetadataGenericParams::new(closure_requested, checksum_type, file_size),
            src_file_name,
            dest_file_name,
        );
        let file = ctx.vfs.open_read(&source_path)?;
        ctx.send_pdu(&metadata_pdu)?;

        let transaction = &mut self.transaction;
        transaction.trans_mode = TransmissionMode::Unacknowledged;
        transaction.checksum_type = checksum_type;
        transaction.closure_requested = closure_requested;
        transaction.src_file_name = put_request.source_file;
        transaction.dest_file_name = put_request.dest_file;
        transaction.file_path = Some(source_path);
        transaction.file_size = file_size;
        transaction.progress = 0;
        transaction.checksum = FileChecksum::new(checksum_type);
        transaction.file = Some(file);
        self.pdu_conf = Some(pdu_conf);
        self.segment_len = remote_cfg.max_file_segment_len.clamp(1, MAX_SEGMENT_LEN);
        self.state = State::S2;
        log::info!(
            "transaction {} started: {} -> {} ({} bytes)",
            transaction.id(),
            transaction.src_file_name,
            transaction.dest_file_name,
            file_size
        );
        ctx.user.transaction_indication(&transaction.id());
        Ok(())
    }

    fn send_file_data<Vfs, User, Hook, Sender>(
        &mut self,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        if self.transaction.is_halted() {
            return Ok(());
        }
        let pdu_conf = match self.pdu_conf {
            Some(pdu_conf) => pdu_conf,
            None => return Ok(()),
        };
        let offset = self.transaction.progress;
        let file_size = self.transaction.file_size;
        let file = match self.transaction.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };
        if offset >= file_size {
            self.eof_pending = true;
            self.transaction.close_file();
            return Ok(());
        }
        let len = (file_size - offset).min(self.segment_len as u64) as usize;
        let mut chunk = vec![0; len];
        let read_result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut chunk));
        if let Err(e) = read_result {
            log::error!(
                "reading segment at offset {offset} of transaction {} failed: {e}",
                self.transaction.id()
            );
            self.handle_fault(ConditionCode::FilestoreRejection, ctx)?;
            if self.transaction.is_active() && !self.transaction.is_halted() {
                // The fault was ignored: skip the unreadable segment. The receiver detects the
                // gap through the EOF checksum.
                self.transaction.progress = offset + len as u64;
            }
            return Ok(());
        }
        if let Some(checksum) = self.transaction.checksum.as_mut() {
            checksum.update(offset, &chunk);
        }
        let file_data = FileDataPdu::new_no_seg_metadata(
            PduHeader::new_for_file_data_default(pdu_conf, 0),
            offset,
            &chunk,
        );
        ctx.send_pdu(&file_data)?;
        self.transaction.progress = offset + len as u64;
        Ok(())
    }

    fn send_file_directive<Vfs, User, Hook, Sender>(
        &mut self,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        if self.transaction.is_halted() || !self.eof_pending {
            return Ok(());
        }
        let pdu_conf = match self.pdu_conf {
            Some(pdu_conf) => pdu_conf,
            None => return Ok(()),
        };
        let checksum = self
            .transaction
            .checksum
            .take()
            .map(FileChecksum::finalize)
            .unwrap_or(0);
        let eof = EofPdu::new_no_error(
            PduHeader::new_no_file_data(pdu_conf, 0),
            checksum,
            self.transaction.file_size,
        );
        ctx.send_pdu(&eof)?;
        self.eof_pending = false;
        if ctx.mib.indication_cfg().eof_sent {
            ctx.user.eof_sent_indication(&self.transaction.id());
        }
        self.transaction.condition_code = ConditionCode::NoError;
        self.transaction.delivery_code = DeliveryCode::Complete;
        self.transaction.file_status = FileStatus::Unreported;
        ctx.notice_of_completion(&mut self.transaction);
        self.state = State::S1;
        Ok(())
    }

    /// Notice of cancellation: the EOF carries the condition code, the checksum of the data
    /// sent so far and the progress as file size.
    fn cancel<Vfs, User, Hook, Sender>(
        &mut self,
        condition_code: ConditionCode,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        log::info!(
            "cancelling transaction {} with {:?}",
            self.transaction.id(),
            condition_code
        );
        self.transaction.flags.cancelled = true;
        self.transaction.condition_code = condition_code;
        self.transaction.delivery_code = DeliveryCode::Incomplete;
        self.transaction.file_status = FileStatus::Unreported;
        self.eof_pending = false;
        self.transaction.close_file();
        let checksum = self
            .transaction
            .checksum
            .take()
            .map(FileChecksum::finalize)
            .unwrap_or(0);
        let send_result = match self.pdu_conf {
            Some(pdu_conf) => {
                let eof = EofPdu::new(
                    PduHeader::new_no_file_data(pdu_conf, 0),
                    condition_code,
                    checksum,
                    self.transaction.progress,
                    Some(EntityIdTlv::new(ctx.mib.local_entity_id())),
                );
                ctx.send_pdu(&eof)
            }
            None => Ok(()),
        };
        if send_result.is_ok() && ctx.mib.indication_cfg().eof_sent {
            ctx.user.eof_sent_indication(&self.transaction.id());
        }
        ctx.notice_of_completion(&mut self.transaction);
        self.state = State::S1;
        send_result
    }

    fn handle_fault<Vfs, User, Hook, Sender>(
        &mut self,
        condition_code: ConditionCode,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        match ctx.declare_fault(&mut self.transaction, condition_code) {
            FaultHandlerCode::NoticeOfCancellation => self.cancel(condition_code, ctx),
            FaultHandlerCode::NoticeOfSuspension => {
                ctx.suspend(
                    &mut self.transaction,
                    &mut self.inactivity_timer,
                    condition_code,
                );
                Ok(())
            }
            FaultHandlerCode::IgnoreError => Ok(()),
            FaultHandlerCode::AbandonTransaction => {
                ctx.abandon(&mut self.transaction, condition_code);
                Ok(())
            }
        }
    }
}
