//! Transaction state machines.
//!
//! Each transaction is driven by exactly one [Machine]. A machine consumes [Event]s, emits
//! PDUs through the [PduSender] of its [MachineContext] and performs the file I/O of its
//! transaction. Events without a transition in the current state are logged, counted as
//! anomalies of the transaction and otherwise ignored.
//!
//! Only the unacknowledged variants [Sender1] and [Receiver1] exist. The acknowledged mode
//! would be added as two further variants of [Machine].
use spacepackets::cfdp::{ConditionCode, FaultHandlerCode, PduType};

use crate::{
    filestore::{FilestoreError, VirtualFilestore},
    mib::Mib,
    pdu::{CfdpPdu, Pdu, PduBody, PduError, WritablePduPacket},
    request::{PutRequest, RequestError},
    timer::Timer,
    transaction::Transaction,
    user::{CfdpUser, TransactionReport},
    EntityType, FaultHandler, GenericSendError, PduSender, TransactionId, UserFaultHook,
};

mod receiver;
mod sender;

pub use receiver::Receiver1;
pub use sender::Sender1;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MachineError {
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("send error: {0}")]
    Send(#[from] GenericSendError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MachineError> for RequestError {
    fn from(value: MachineError) -> Self {
        match value {
            MachineError::Filestore(e) => RequestError::Filestore(e),
            MachineError::Pdu(e) => RequestError::Pdu(e),
            MachineError::Send(e) => RequestError::Send(e),
            MachineError::Io(e) => RequestError::Filestore(FilestoreError::Io(e)),
        }
    }
}

/// Machine state. The meaning depends on the role:
///
/// | State | [Sender1]         | [Receiver1]         |
/// |-------|-------------------|---------------------|
/// | S1    | awaiting put      | awaiting metadata   |
/// | S2    | transferring      | awaiting EOF        |
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    S1,
    S2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PutRequest(PutRequest),
    ReportRequest,
    CancelRequest,
    SuspendRequest,
    ResumeRequest,
    Freeze,
    Thaw,
    /// Kernel tick: send the next file segment.
    SendFileData,
    /// Kernel tick: send pending file directives.
    SendFileDirective,
    MetadataPdu(Pdu),
    FileDataPdu(Pdu),
    /// EOF with the no error condition code.
    EofPdu(Pdu),
    /// EOF with any other condition code.
    EofCancelPdu(Pdu),
    OtherDirectivePdu(Pdu),
    InactivityTimerExpired,
}

impl Event {
    pub fn from_pdu(pdu: Pdu) -> Result<Self, PduError> {
        let event: fn(Pdu) -> Event = match pdu.body()? {
            PduBody::Metadata(_) => Event::MetadataPdu,
            PduBody::FileData(_) => Event::FileDataPdu,
            PduBody::Eof(eof) if eof.condition_code() == ConditionCode::NoError => Event::EofPdu,
            PduBody::Eof(_) => Event::EofCancelPdu,
            _ => Event::OtherDirectivePdu,
        };
        Ok(event(pdu))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::PutRequest(_) => "put request",
            Event::ReportRequest => "report request",
            Event::CancelRequest => "cancel request",
            Event::SuspendRequest => "suspend request",
            Event::ResumeRequest => "resume request",
            Event::Freeze => "freeze",
            Event::Thaw => "thaw",
            Event::SendFileData => "send file data",
            Event::SendFileDirective => "send file directive",
            Event::MetadataPdu(_) => "metadata PDU",
            Event::FileDataPdu(_) => "file data PDU",
            Event::EofPdu(_) => "EOF PDU",
            Event::EofCancelPdu(_) => "EOF cancel PDU",
            Event::OtherDirectivePdu(_) => "other directive PDU",
            Event::InactivityTimerExpired => "inactivity timer expired",
        }
    }
}

/// Everything a machine step may touch besides its own transaction.
pub struct MachineContext<'a, Vfs, User, Hook: UserFaultHook, Sender> {
    pub mib: &'a mut Mib,
    pub vfs: &'a Vfs,
    pub user: &'a mut User,
    pub fault_handler: &'a FaultHandler<Hook>,
    pub pdu_sender: &'a Sender,
}

impl<Vfs: VirtualFilestore, User: CfdpUser, Hook: UserFaultHook, Sender: PduSender>
    MachineContext<'_, Vfs, User, Hook, Sender>
{
    pub(crate) fn send_pdu(
        &self,
        pdu: &(impl WritablePduPacket + CfdpPdu),
    ) -> Result<(), MachineError> {
        let raw = pdu.to_vec()?;
        self.pdu_sender
            .send_pdu(pdu.pdu_type(), pdu.file_directive_type(), &raw)?;
        if pdu.pdu_type() == PduType::FileDirective {
            log::debug!(
                "sent {:?} for transaction {}",
                pdu.file_directive_type(),
                TransactionId::from(pdu.pdu_header().common_pdu_conf())
            );
        }
        Ok(())
    }

    /// Reports the fault to the fault handler and returns the handler the machine has to
    /// apply. The fault indication is issued for ignored faults.
    pub(crate) fn declare_fault(
        &mut self,
        transaction: &mut Transaction,
        condition_code: ConditionCode,
    ) -> FaultHandlerCode {
        log::warn!(
            "fault {:?} declared for transaction {}",
            condition_code,
            transaction.id()
        );
        let fh_code =
            self.fault_handler
                .report_fault(transaction.id(), condition_code, transaction.progress);
        if fh_code == FaultHandlerCode::IgnoreError {
            self.user
                .fault_indication(&transaction.id(), condition_code, transaction.progress);
        }
        fh_code
    }

    pub(crate) fn abandon(&mut self, transaction: &mut Transaction, condition_code: ConditionCode) {
        log::warn!("abandoning transaction {}", transaction.id());
        transaction.condition_code = condition_code;
        transaction.flags.abandoned = true;
        transaction.close_file();
        self.user
            .abandoned_indication(&transaction.id(), condition_code, transaction.progress);
    }

    pub(crate) fn suspend(
        &mut self,
        transaction: &mut Transaction,
        timer: &mut Timer,
        condition_code: ConditionCode,
    ) {
        if transaction.flags.suspended {
            return;
        }
        transaction.flags.suspended = true;
        timer.pause();
        if self.mib.indication_cfg().suspended {
            self.user.suspended_indication(&transaction.id(), condition_code);
        }
    }

    pub(crate) fn resume(&mut self, transaction: &mut Transaction, timer: &mut Timer) {
        if !transaction.flags.suspended {
            log::debug!("transaction {} is not suspended", transaction.id());
            return;
        }
        transaction.flags.suspended = false;
        if !transaction.flags.frozen {
            timer.resume();
        }
        if self.mib.indication_cfg().resumed {
            self.user
                .resumed_indication(&transaction.id(), transaction.progress);
        }
    }

    pub(crate) fn freeze(&mut self, transaction: &mut Transaction, timer: &mut Timer) {
        transaction.flags.frozen = true;
        timer.pause();
    }

    pub(crate) fn thaw(&mut self, transaction: &mut Transaction, timer: &mut Timer) {
        transaction.flags.frozen = false;
        if !transaction.flags.suspended {
            timer.resume();
        }
    }

    pub(crate) fn notice_of_completion(&mut self, transaction: &mut Transaction) {
        transaction.flags.finished = true;
        transaction.close_file();
        log::info!(
            "transaction {} finished with {:?}, {:?}",
            transaction.id(),
            transaction.condition_code,
            transaction.delivery_code
        );
        if self.mib.indication_cfg().transaction_finished {
            self.user
                .transaction_finished_indication(&crate::user::TransactionFinishedParams::new(
                    transaction.id(),
                    transaction.condition_code,
                    transaction.delivery_code,
                    transaction.file_status,
                ));
        }
    }
}

pub(crate) fn transaction_report(transaction: &Transaction, state: State) -> TransactionReport {
    TransactionReport::new(
        transaction.id(),
        transaction.role(),
        state,
        transaction.flags,
        transaction.condition_code,
        transaction.delivery_code,
        transaction.progress,
        transaction.file_size,
        transaction.anomalies,
    )
}

pub(crate) fn ignore_event(transaction: &mut Transaction, state: State, event: &Event) {
    transaction.record_anomaly();
    log::debug!(
        "transaction {}: no transition for {} in state {:?}",
        transaction.id(),
        event.name(),
        state
    );
}

#[derive(Debug)]
pub enum Machine {
    Sender1(Sender1),
    Receiver1(Receiver1),
}

impl Machine {
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
        match self {
            Machine::Sender1(sender) => sender.update_state(event, ctx),
            Machine::Receiver1(receiver) => receiver.update_state(event, ctx),
        }
    }

    pub fn transaction(&self) -> &Transaction {
        match self {
            Machine::Sender1(sender) => sender.transaction(),
            Machine::Receiver1(receiver) => receiver.transaction(),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction().id()
    }

    pub fn role(&self) -> EntityType {
        self.transaction().role()
    }

    pub fn state(&self) -> State {
        match self {
            Machine::Sender1(sender) => sender.state(),
            Machine::Receiver1(receiver) => receiver.state(),
        }
    }

    pub fn inactivity_timer(&self) -> &Timer {
        match self {
            Machine::Sender1(sender) => sender.inactivity_timer(),
            Machine::Receiver1(receiver) => receiver.inactivity_timer(),
        }
    }

    pub fn inactivity_timer_mut(&mut self) -> &mut Timer {
        match self {
            Machine::Sender1(sender) => sender.inactivity_timer_mut(),
            Machine::Receiver1(receiver) => receiver.inactivity_timer_mut(),
        }
    }

    /// Finished or abandoned machines can be removed from the transaction table.
    pub fn is_finished(&self) -> bool {
        !self.transaction().is_active()
    }

    pub fn report(&self) -> TransactionReport {
        transaction_report(self.transaction(), self.state())
    }
}
