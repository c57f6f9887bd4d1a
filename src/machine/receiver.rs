//! Class 1 receiving machine.
use std::io::{Seek, SeekFrom, Write};

use spacepackets::{
    cfdp::{tlv::EntityIdTlv, ConditionCode, Direction, FaultHandlerCode, TransmissionMode},
    util::{UnsignedByteField, UnsignedEnum},
};

use super::{ignore_event, transaction_report, Event, MachineContext, MachineError, State};
use crate::{
    checksum::FileChecksum,
    filestore::VirtualFilestore,
    pdu::{
        lv_file_name, CommonPduConfig, DeliveryCode, FileStatus, FinishedPduCreator, Pdu,
        PduBody, PduHeader,
    },
    timer::{Timer, TimerState},
    transaction::Transaction,
    user::{CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams},
    EntityType, PduSender, TransactionId, UserFaultHook,
};

const CHECKSUM_VERIFICATION_BUF_LEN: usize = 4096;

#[derive(Debug)]
pub struct Receiver1 {
    state: State,
    transaction: Transaction,
    /// Header template for PDUs towards the sender. Set by the metadata PDU.
    pdu_conf: Option<CommonPduConfig>,
    inactivity_timer: Timer,
}

impl Receiver1 {
    pub fn new(id: TransactionId, remote_id: UnsignedByteField) -> Self {
        Self {
            state: State::S1,
            transaction: Transaction::new(id, EntityType::Receiving, remote_id),
            pdu_conf: None,
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
            (State::S1, Event::MetadataPdu(pdu)) => self.handle_metadata_pdu(&pdu, ctx),
            (_, Event::ReportRequest) => {
                ctx.user
                    .report_indication(&transaction_report(&self.transaction, self.state));
                Ok(())
            }
            (State::S2, Event::FileDataPdu(pdu)) => self.handle_file_data_pdu(&pdu, ctx),
            (State::S2, Event::EofPdu(pdu)) => self.handle_eof_pdu(&pdu, ctx),
            (State::S2, Event::EofCancelPdu(pdu)) => self.handle_eof_cancel_pdu(&pdu, ctx),
            (State::S2, Event::InactivityTimerExpired) => {
                self.handle_fault(ConditionCode::InactivityDetected, ctx)?;
                if self.transaction.is_active()
                    && self.inactivity_timer.state() == TimerState::Off
                    && !self.transaction.flags.suspended
                {
                    self.start_inactivity_timer(ctx);
                }
                Ok(())
            }
            (State::S2, Event::CancelRequest) => {
                self.notice_of_cancellation(ConditionCode::CancelRequestReceived, ctx)
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
                if !self.transaction.is_halted()
                    && self.inactivity_timer.state() == TimerState::Off
                {
                    self.start_inactivity_timer(ctx);
                }
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

    fn start_inactivity_timer<Vfs, User, Hook: UserFaultHook, Sender>(
        &mut self,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) {
        let timeout = ctx.mib.inactivity_timeout(self.transaction.remote_id());
        self.inactivity_timer.start(timeout);
    }

    fn handle_metadata_pdu<Vfs, User, Hook, Sender>(
        &mut self,
        pdu: &Pdu,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let metadata = match pdu.body()? {
            PduBody::Metadata(metadata) => metadata,
            _ => return Ok(()),
        };
        let params = *metadata.metadata_params();
        let src_file_name = lv_file_name(&metadata.src_file_name());
        let dest_file_name = lv_file_name(&metadata.dest_file_name());
        let header_conf = *pdu.pdu_conf();
        if header_conf.trans_mode == TransmissionMode::Acknowledged {
            log::warn!(
                "transaction {} requests acknowledged mode, handling it unacknowledged",
                self.transaction.id()
            );
        }
        let mut reply_conf = header_conf;
        reply_conf.direction = Direction::TowardsSender;
        reply_conf.trans_mode = TransmissionMode::Unacknowledged;
        self.pdu_conf = Some(reply_conf);

        let transaction = &mut self.transaction;
        transaction.trans_mode = TransmissionMode::Unacknowledged;
        transaction.checksum_type = params.checksum_type;
        transaction.closure_requested = params.closure_requested;
        transaction.file_size = params.file_size;
        transaction.src_file_name = src_file_name.to_string();
        transaction.dest_file_name = dest_file_name.to_string();
        stage_pdu(&*ctx, transaction.id(), "metadata", pdu);
        log::info!(
            "transaction {} started: receiving {} ({} bytes)",
            transaction.id(),
            transaction.dest_file_name,
            transaction.file_size
        );
        ctx.user
            .metadata_recvd_indication(&MetadataReceivedParams::new(
                transaction.id(),
                transaction.remote_id(),
                params.file_size,
                src_file_name,
                dest_file_name,
            ));
        self.state = State::S2;
        self.start_inactivity_timer(ctx);

        if !FileChecksum::is_supported(params.checksum_type) {
            self.handle_fault(ConditionCode::UnsupportedChecksumType, ctx)?;
            if !self.transaction.is_active() {
                return Ok(());
            }
        }
        if dest_file_name.is_empty() {
            return Ok(());
        }
        let open_result = ctx
            .vfs
            .incoming_path(dest_file_name)
            .and_then(|path| ctx.vfs.open_write(&path).map(|file| (path, file)));
        match open_result {
            Ok((path, file)) => {
                self.transaction.file_path = Some(path);
                self.transaction.file = Some(file);
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "transaction {}: rejecting destination file {dest_file_name:?}: {e}",
                    self.transaction.id()
                );
                self.transaction.file_status = FileStatus::DiscardedFsRejection;
                self.handle_fault(ConditionCode::FilestoreRejection, ctx)
            }
        }
    }

    fn handle_file_data_pdu<Vfs, User, Hook, Sender>(
        &mut self,
        pdu: &Pdu,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let file_data = match pdu.body()? {
            PduBody::FileData(file_data) => file_data,
            _ => return Ok(()),
        };
        let offset = file_data.offset();
        let segment_end = match offset.checked_add(file_data.file_data().len() as u64) {
            Some(segment_end) if segment_end <= self.transaction.file_size => segment_end,
            _ => {
                log::warn!(
                    "transaction {}: segment at offset {offset} with {} bytes exceeds file size {}",
                    self.transaction.id(),
                    file_data.file_data().len(),
                    self.transaction.file_size
                );
                return self.handle_fault(ConditionCode::FileSizeError, ctx);
            }
        };
        let file = match self.transaction.file.as_mut() {
            Some(file) => file,
            None => {
                ignore_event(
                    &mut self.transaction,
                    self.state,
                    &Event::FileDataPdu(pdu.clone()),
                );
                return Ok(());
            }
        };
        let write_result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(file_data.file_data()));
        if let Err(e) = write_result {
            log::error!(
                "transaction {}: writing segment at offset {offset} failed: {e}",
                self.transaction.id()
            );
            return self.handle_fault(ConditionCode::FilestoreRejection, ctx);
        }
        self.transaction.progress = self.transaction.progress.max(segment_end);
        if ctx.mib.indication_cfg().file_segment_recv {
            ctx.user
                .file_segment_recvd_indication(&FileSegmentRecvdParams::new(
                    self.transaction.id(),
                    offset,
                    file_data.file_data().len(),
                    file_data.segment_metadata().and_then(|seg_meta| seg_meta.metadata()),
                ));
        }
        Ok(())
    }

    fn handle_eof_pdu<Vfs, User, Hook, Sender>(
        &mut self,
        pdu: &Pdu,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let eof = match pdu.body()? {
            PduBody::Eof(eof) => eof,
            _ => return Ok(()),
        };
        stage_pdu(&*ctx, self.transaction.id(), "eof", pdu);
        if ctx.mib.indication_cfg().eof_recv {
            ctx.user.eof_recvd_indication(&self.transaction.id());
        }
        self.inactivity_timer.cancel();
        self.transaction.close_file();

        let mut condition_code = ConditionCode::NoError;
        if self.transaction.progress > eof.file_size() {
            condition_code = ConditionCode::FileSizeError;
            self.handle_fault(condition_code, ctx)?;
            if !self.transaction.is_active() {
                return Ok(());
            }
        }
        self.transaction.file_size = eof.file_size();
        let mut complete = self.transaction.progress == eof.file_size();
        if let Some(path) = self.transaction.file_path.clone() {
            let checksum_type = self.transaction.checksum_type;
            if FileChecksum::is_supported(checksum_type) {
                let mut verification_buf = vec![0; CHECKSUM_VERIFICATION_BUF_LEN];
                let verify_result = ctx.vfs.checksum_verify(
                    eof.file_checksum(),
                    &path,
                    checksum_type,
                    eof.file_size(),
                    &mut verification_buf,
                );
                let fault = match verify_result {
                    Ok(true) => None,
                    Ok(false) => Some(ConditionCode::FileChecksumFailure),
                    Err(e) => {
                        log::error!(
                            "transaction {}: checksum verification failed: {e}",
                            self.transaction.id()
                        );
                        Some(ConditionCode::FilestoreRejection)
                    }
                };
                if let Some(fault) = fault {
                    complete = false;
                    condition_code = fault;
                    self.handle_fault(fault, ctx)?;
                    if !self.transaction.is_active() {
                        return Ok(());
                    }
                }
            }
            self.transaction.file_status = FileStatus::Retained;
        }
        self.transaction.condition_code = condition_code;
        self.transaction.delivery_code = if complete {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        };
        self.finish(ctx)
    }

    fn handle_eof_cancel_pdu<Vfs, User, Hook, Sender>(
        &mut self,
        pdu: &Pdu,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let eof = match pdu.body()? {
            PduBody::Eof(eof) => eof,
            _ => return Ok(()),
        };
        stage_pdu(&*ctx, self.transaction.id(), "eof", pdu);
        if ctx.mib.indication_cfg().eof_recv {
            ctx.user.eof_recvd_indication(&self.transaction.id());
        }
        log::info!(
            "transaction {} cancelled by the sender with {:?}",
            self.transaction.id(),
            eof.condition_code()
        );
        self.notice_of_cancellation(eof.condition_code(), ctx)
    }

    /// Finishes the transaction with an incomplete delivery. The file is deleted if the remote
    /// entity configuration requests disposition on cancellation.
    fn notice_of_cancellation<Vfs, User, Hook, Sender>(
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
        self.transaction.flags.cancelled = true;
        self.transaction.condition_code = condition_code;
        self.transaction.delivery_code = DeliveryCode::Incomplete;
        self.inactivity_timer.cancel();
        self.transaction.close_file();
        if let Some(path) = self.transaction.file_path.clone() {
            let discard = ctx
                .mib
                .remote_config(self.transaction.remote_id())
                .disposition_on_cancellation;
            self.transaction.file_status = FileStatus::Retained;
            if discard {
                match ctx.vfs.remove_file(&path) {
                    Ok(()) => self.transaction.file_status = FileStatus::DiscardDeliberately,
                    Err(e) => log::warn!(
                        "transaction {}: removing incomplete file failed: {e}",
                        self.transaction.id()
                    ),
                }
            }
        }
        self.finish(ctx)
    }

    /// Sends the Finished PDU if closure was requested and issues the finished indication.
    fn finish<Vfs, User, Hook, Sender>(
        &mut self,
        ctx: &mut MachineContext<'_, Vfs, User, Hook, Sender>,
    ) -> Result<(), MachineError>
    where
        Vfs: VirtualFilestore,
        User: CfdpUser,
        Hook: UserFaultHook,
        Sender: PduSender,
    {
        let mut send_result = Ok(());
        if let (true, Some(pdu_conf)) = (self.transaction.closure_requested, self.pdu_conf) {
            let transaction = &self.transaction;
            let header = PduHeader::new_no_file_data(pdu_conf, 0);
            let finished = if transaction.condition_code == ConditionCode::NoError {
                FinishedPduCreator::new_default(
                    header,
                    transaction.delivery_code,
                    transaction.file_status,
                )
            } else {
                FinishedPduCreator::new_with_error(
                    header,
                    transaction.condition_code,
                    transaction.delivery_code,
                    transaction.file_status,
                    EntityIdTlv::new(ctx.mib.local_entity_id()),
                )
            };
            send_result = ctx.send_pdu(&finished);
        }
        ctx.notice_of_completion(&mut self.transaction);
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
            FaultHandlerCode::NoticeOfCancellation => {
                self.notice_of_cancellation(condition_code, ctx)
            }
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
                self.inactivity_timer.cancel();
                ctx.abandon(&mut self.transaction, condition_code);
                Ok(())
            }
        }
    }
}

/// Staging failures are logged and do not affect the transaction.
fn stage_pdu<Vfs: VirtualFilestore, User, Hook: UserFaultHook, Sender>(
    ctx: &MachineContext<'_, Vfs, User, Hook, Sender>,
    id: TransactionId,
    suffix: &str,
    pdu: &Pdu,
) {
    let name = format!("{}_{}.{suffix}", id.source_id().value(), id.seq_num().value());
    match ctx.vfs.stage(&name, pdu.raw_pdu()) {
        Ok(true) => log::debug!("staged {name}"),
        Ok(false) => (),
        Err(e) => log::warn!("staging {name} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use spacepackets::{
        cfdp::{lv::Lv, ChecksumType, CrcFlag, LargeFileFlag, PduType},
        util::UnsignedByteFieldU16,
    };
    use tempfile::tempdir;

    use super::*;
    use crate::{
        checksum::CRC_32,
        filestore::NativeFilestore,
        machine::{tests::TestEnvironment, Machine},
        mib::MibValue,
        pdu::{EofPdu, FileDataPdu, MetadataGenericParams, MetadataPduCreator},
        tests::{LOCAL_ID, REMOTE_ID},
    };

    const HELLO_WORLD: &[u8] = b"Hello World!";

    fn sender_conf_with_flag(seq_num: u16, file_flag: LargeFileFlag) -> CommonPduConfig {
        CommonPduConfig::new(
            REMOTE_ID,
            LOCAL_ID,
            UnsignedByteFieldU16::new(seq_num),
            TransmissionMode::Unacknowledged,
            file_flag,
            CrcFlag::NoCrc,
            Direction::TowardsReceiver,
        )
        .unwrap()
    }

    fn sender_conf(seq_num: u16) -> CommonPduConfig {
        sender_conf_with_flag(seq_num, LargeFileFlag::Normal)
    }

    fn receiver_machine(seq_num: u16) -> Machine {
        Machine::Receiver1(Receiver1::new(
            TransactionId::from(&sender_conf(seq_num)),
            REMOTE_ID.into(),
        ))
    }

    fn environment(root: &Path) -> TestEnvironment {
        TestEnvironment::new(LOCAL_ID, NativeFilestore::new_with_single_root(root))
    }

    fn metadata_pdu(conf: CommonPduConfig, file_size: u64, dest: &str, closure: bool) -> Pdu {
        let metadata = MetadataPduCreator::new_no_opts(
            PduHeader::new_no_file_data(conf, 0),
            MetadataGenericParams::new(closure, ChecksumType::Crc32, file_size),
            Lv::new_from_str("src.txt").unwrap(),
            Lv::new_from_str(dest).unwrap(),
        );
        Pdu::new(&metadata).unwrap()
    }

    fn metadata_event(seq_num: u16, file_size: u64, dest: &str, closure: bool) -> Event {
        Event::MetadataPdu(metadata_pdu(sender_conf(seq_num), file_size, dest, closure))
    }

    fn file_data_pdu(conf: CommonPduConfig, offset: u64, data: &[u8]) -> Pdu {
        let header = PduHeader::new_for_file_data_default(conf, 0);
        let file_data = FileDataPdu::new_no_seg_metadata(header, offset, data);
        Pdu::new(&file_data).unwrap()
    }

    fn file_data_event(seq_num: u16, offset: u64, data: &[u8]) -> Event {
        Event::FileDataPdu(file_data_pdu(sender_conf(seq_num), offset, data))
    }

    fn eof_event(seq_num: u16, checksum: u32, file_size: u64) -> Event {
        let header = PduHeader::new_no_file_data(sender_conf(seq_num), 0);
        let eof = EofPdu::new_no_error(header, checksum, file_size);
        Event::EofPdu(Pdu::new(&eof).unwrap())
    }

    fn eof_cancel_event(seq_num: u16, progress: u64) -> Event {
        let header = PduHeader::new_no_file_data(sender_conf(seq_num), 0);
        let eof = EofPdu::new(
            header,
            ConditionCode::CancelRequestReceived,
            0,
            progress,
            Some(EntityIdTlv::new(REMOTE_ID.into())),
        );
        Event::EofCancelPdu(Pdu::new(&eof).unwrap())
    }

    #[test]
    fn test_small_file_reception() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(1);
        env.step(&mut machine, metadata_event(1, 12, "b.txt", false))
            .unwrap();
        assert_eq!(machine.state(), State::S2);
        assert_eq!(machine.inactivity_timer().state(), TimerState::Running);
        let md = env.user.metadata_recv_queue.pop_front().unwrap();
        assert_eq!(md.source_id, REMOTE_ID.into());
        assert_eq!(md.file_size, 12);
        assert_eq!(md.src_file_name, "src.txt");
        assert_eq!(md.dest_file_name, "b.txt");

        env.step(&mut machine, file_data_event(1, 0, HELLO_WORLD))
            .unwrap();
        assert_eq!(env.user.file_seg_recvd_queue.len(), 1);
        env.step(&mut machine, eof_event(1, CRC_32.checksum(HELLO_WORLD), 12))
            .unwrap();
        assert!(machine.is_finished());
        assert_eq!(fs::read(tmpdir.path().join("b.txt")).unwrap(), HELLO_WORLD);
        assert_eq!(env.user.eof_recvd_call_count, 1);
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::NoError);
        assert_eq!(finished.delivery_code, DeliveryCode::Complete);
        assert_eq!(finished.file_status, FileStatus::Retained);
        assert!(env.sent_pdus().is_empty());
        assert!(env.fault_handler.user_hook.borrow().all_queues_empty());
    }

    #[test]
    fn test_out_of_order_segments() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(2);
        env.step(&mut machine, metadata_event(2, 12, "sub/dir/b.txt", false))
            .unwrap();
        env.step(&mut machine, file_data_event(2, 6, &HELLO_WORLD[6..]))
            .unwrap();
        env.step(&mut machine, file_data_event(2, 0, &HELLO_WORLD[..6]))
            .unwrap();
        assert_eq!(machine.report().progress, 12);
        env.step(&mut machine, eof_event(2, CRC_32.checksum(HELLO_WORLD), 12))
            .unwrap();
        assert_eq!(
            fs::read(tmpdir.path().join("sub/dir/b.txt")).unwrap(),
            HELLO_WORLD
        );
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.delivery_code, DeliveryCode::Complete);
    }

    #[test]
    fn test_checksum_failure_is_ignored_by_default() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(3);
        env.step(&mut machine, metadata_event(3, 12, "b.txt", false))
            .unwrap();
        env.step(&mut machine, file_data_event(3, 0, HELLO_WORLD))
            .unwrap();
        env.step(&mut machine, eof_event(3, 0xdeadbeef, 12)).unwrap();
        assert!(machine.is_finished());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::FileChecksumFailure);
        assert_eq!(finished.delivery_code, DeliveryCode::Incomplete);
        assert_eq!(finished.file_status, FileStatus::Retained);
        assert_eq!(env.user.fault_queue.len(), 1);
        assert_eq!(
            env.user.fault_queue[0].1,
            ConditionCode::FileChecksumFailure
        );
        assert_eq!(env.fault_handler.user_hook.borrow().ignored_queue.len(), 1);
    }

    #[test]
    fn test_segment_beyond_file_size() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(4);
        env.step(&mut machine, metadata_event(4, 4, "b.txt", false))
            .unwrap();
        env.step(&mut machine, file_data_event(4, 0, HELLO_WORLD))
            .unwrap();
        assert!(machine.is_finished());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::FileSizeError);
        assert_eq!(finished.delivery_code, DeliveryCode::Incomplete);
        let hook = env.fault_handler.user_hook.borrow();
        assert_eq!(hook.notice_of_cancellation_queue.len(), 1);
    }

    #[test]
    fn test_segment_offset_overflow() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(14);
        let conf = sender_conf_with_flag(14, LargeFileFlag::Large);
        env.step(
            &mut machine,
            Event::MetadataPdu(metadata_pdu(conf, 100, "b.txt", false)),
        )
        .unwrap();
        env.step(
            &mut machine,
            Event::FileDataPdu(file_data_pdu(conf, u64::MAX - 1, &HELLO_WORLD[..4])),
        )
        .unwrap();
        assert!(machine.is_finished());
        assert_eq!(machine.report().progress, 0);
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::FileSizeError);
        assert_eq!(finished.delivery_code, DeliveryCode::Incomplete);
        let hook = env.fault_handler.user_hook.borrow();
        assert_eq!(hook.notice_of_cancellation_queue.len(), 1);
        assert_eq!(
            hook.notice_of_cancellation_queue[0].1,
            ConditionCode::FileSizeError
        );
    }

    #[test]
    fn test_cancel_eof_with_disposition() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        env.mib
            .set_remote(
                REMOTE_ID.into(),
                "disposition_on_cancellation",
                MibValue::Bool(true),
            )
            .unwrap();
        let mut machine = receiver_machine(5);
        env.step(&mut machine, metadata_event(5, 12, "b.txt", false))
            .unwrap();
        env.step(&mut machine, file_data_event(5, 0, &HELLO_WORLD[..4]))
            .unwrap();
        assert!(tmpdir.path().join("b.txt").exists());
        env.step(&mut machine, eof_cancel_event(5, 4)).unwrap();
        assert!(machine.is_finished());
        assert!(!tmpdir.path().join("b.txt").exists());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::CancelRequestReceived);
        assert_eq!(finished.delivery_code, DeliveryCode::Incomplete);
        assert_eq!(finished.file_status, FileStatus::DiscardDeliberately);
    }

    #[test]
    fn test_cancel_eof_keeps_file_by_default() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(6);
        env.step(&mut machine, metadata_event(6, 12, "b.txt", false))
            .unwrap();
        env.step(&mut machine, eof_cancel_event(6, 0)).unwrap();
        assert!(tmpdir.path().join("b.txt").exists());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.file_status, FileStatus::Retained);
    }

    #[test]
    fn test_inactivity_cancels_transaction() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        env.mib
            .set_remote(REMOTE_ID.into(), "inactivity_timeout", MibValue::Seconds(0.0))
            .unwrap();
        let mut machine = receiver_machine(7);
        env.step(&mut machine, metadata_event(7, 12, "b.txt", false))
            .unwrap();
        assert!(machine.inactivity_timer().expired());
        env.step(&mut machine, Event::InactivityTimerExpired)
            .unwrap();
        assert!(machine.is_finished());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::InactivityDetected);
        let hook = env.fault_handler.user_hook.borrow();
        assert_eq!(hook.notice_of_cancellation_queue.len(), 1);
        assert_eq!(
            hook.notice_of_cancellation_queue[0].1,
            ConditionCode::InactivityDetected
        );
    }

    #[test]
    fn test_inactivity_with_abandon_handler() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        env.fault_handler.set_fault_handler(
            ConditionCode::InactivityDetected,
            FaultHandlerCode::AbandonTransaction,
        );
        let mut machine = receiver_machine(8);
        env.step(&mut machine, metadata_event(8, 12, "b.txt", false))
            .unwrap();
        env.step(&mut machine, Event::InactivityTimerExpired)
            .unwrap();
        assert!(machine.is_finished());
        assert!(machine.transaction().flags.abandoned);
        assert_eq!(env.user.abandoned_queue.len(), 1);
        assert!(env.user.finished_indic_queue.is_empty());
    }

    #[test]
    fn test_closure_requested_sends_finished_pdu() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(9);
        env.step(&mut machine, metadata_event(9, 12, "b.txt", true))
            .unwrap();
        env.step(&mut machine, file_data_event(9, 0, HELLO_WORLD))
            .unwrap();
        env.step(&mut machine, eof_event(9, CRC_32.checksum(HELLO_WORLD), 12))
            .unwrap();
        let pdus = env.sent_pdus();
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].pdu_type(), PduType::FileDirective);
        assert_eq!(pdus[0].pdu_conf().direction, Direction::TowardsSender);
        assert_eq!(pdus[0].transaction_id(), machine.transaction_id());
        match pdus[0].body().unwrap() {
            PduBody::Finished(finished) => {
                assert_eq!(finished.condition_code(), ConditionCode::NoError);
                assert_eq!(finished.delivery_code(), DeliveryCode::Complete);
                assert_eq!(finished.file_status(), FileStatus::Retained);
            }
            other => panic!("unexpected PDU {other:?}"),
        }
    }

    #[test]
    fn test_invalid_destination_path() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(10);
        env.step(&mut machine, metadata_event(10, 12, "../escape.txt", false))
            .unwrap();
        assert!(machine.is_finished());
        let finished = env.user.finished_indic_queue.pop_front().unwrap();
        assert_eq!(finished.condition_code, ConditionCode::FilestoreRejection);
        assert_eq!(finished.file_status, FileStatus::DiscardedFsRejection);
        assert!(!tmpdir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_staging() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let staging = tmpdir.path().join("staging");
        let mut env = TestEnvironment::new(
            LOCAL_ID,
            NativeFilestore::new(tmpdir.path(), tmpdir.path(), Some(staging.clone())),
        );
        let mut machine = receiver_machine(11);
        let metadata = metadata_event(11, 12, "b.txt", false);
        let raw_metadata = match &metadata {
            Event::MetadataPdu(pdu) => pdu.to_vec(),
            _ => unreachable!(),
        };
        env.step(&mut machine, metadata).unwrap();
        env.step(&mut machine, file_data_event(11, 0, HELLO_WORLD))
            .unwrap();
        env.step(&mut machine, eof_event(11, CRC_32.checksum(HELLO_WORLD), 12))
            .unwrap();
        assert_eq!(fs::read(staging.join("2_11.metadata")).unwrap(), raw_metadata);
        let staged_eof = fs::read(staging.join("2_11.eof")).unwrap();
        let eof = Pdu::from_bytes(&staged_eof).unwrap();
        assert!(matches!(eof.body().unwrap(), PduBody::Eof(eof) if eof.file_size() == 12));
    }

    #[test]
    fn test_pdus_before_metadata_are_anomalies() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        let mut machine = receiver_machine(12);
        env.step(&mut machine, file_data_event(12, 0, HELLO_WORLD))
            .unwrap();
        env.step(&mut machine, eof_event(12, 0, 12)).unwrap();
        assert_eq!(machine.state(), State::S1);
        assert_eq!(machine.report().anomalies, 2);
        assert!(!tmpdir.path().join("b.txt").exists());
    }

    #[test]
    fn test_suspend_pauses_inactivity_timer() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let mut env = environment(tmpdir.path());
        env.mib
            .set_remote(REMOTE_ID.into(), "inactivity_timeout", MibValue::Seconds(0.0))
            .unwrap();
        let mut machine = receiver_machine(13);
        env.step(&mut machine, metadata_event(13, 12, "b.txt", false))
            .unwrap();
        env.step(&mut machine, Event::SuspendRequest).unwrap();
        assert_eq!(machine.inactivity_timer().state(), TimerState::Paused);
        assert!(!machine.inactivity_timer().expired());
        env.step(&mut machine, Event::ResumeRequest).unwrap();
        assert_eq!(machine.inactivity_timer().state(), TimerState::Running);
        assert_eq!(env.user.suspended_queue.len(), 1);
        assert_eq!(env.user.resumed_queue.len(), 1);
    }
}
