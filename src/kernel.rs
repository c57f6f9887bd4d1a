//! CFDP engine.
//!
//! The [Kernel] owns the transaction table, the inbound and outbound PDU queues, the MIB and the
//! sequence counter. It validates user requests, routes received PDUs to the machine of their
//! transaction and drives all machines forward with [Kernel::tick].
//!
//! All methods are synchronous and never block. [crate::scheduler::spawn_engine] runs the
//! kernel on worker threads.
use std::sync::mpsc;

use hashbrown::HashMap;
use spacepackets::{
    cfdp::{Direction, TransmissionMode},
    util::{UnsignedByteField, UnsignedByteFieldU32, UnsignedEnum},
};

use crate::{
    filestore::VirtualFilestore,
    machine::{Event, Machine, MachineContext, MachineError, Receiver1, Sender1},
    mib::Mib,
    pdu::{Pdu, PduError},
    request::{generic_path_checks, PutRequest, Request, RequestError},
    timer::TimerState,
    user::{CfdpUser, TransactionReport},
    EntityType, FaultHandler, GenericSendError, PduOwnedWithInfo, PduSender, TransactionId,
    UserFaultHook,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("send error: {0}")]
    Send(#[from] GenericSendError),
    #[error("machine error: {0}")]
    Machine(#[from] MachineError),
}

/// Result of handling one inbound PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the machine of an existing transaction.
    Routed(TransactionId),
    /// A metadata PDU created a new receiving transaction.
    Created(TransactionId),
    /// File data or EOF PDU for a transaction without a machine.
    DroppedUnrouted(TransactionId),
    DroppedMalformed,
    /// The PDU is addressed to another entity.
    NotForUs,
    /// The machine step returned an error.
    Failed(TransactionId),
}

/// Successful result of [Kernel::request].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Started(TransactionId),
    Report(TransactionReport),
    Delivered(TransactionId),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KernelStats {
    pub pdus_dispatched: u64,
    pub malformed: u64,
    pub unrouted: u64,
    pub not_for_us: u64,
    pub transactions_created: u64,
    pub transactions_finished: u64,
    pub machine_errors: u64,
}

pub struct Kernel<Vfs: VirtualFilestore, User: CfdpUser, Hook: UserFaultHook> {
    mib: Mib,
    vfs: Vfs,
    user: User,
    fault_handler: FaultHandler<Hook>,
    machines: HashMap<TransactionId, Machine>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<PduOwnedWithInfo>,
    outbound_rx: mpsc::Receiver<PduOwnedWithInfo>,
    next_seq_num: u32,
    stats: KernelStats,
}

impl<Vfs: VirtualFilestore, User: CfdpUser, Hook: UserFaultHook> Kernel<Vfs, User, Hook> {
    pub fn new(mib: Mib, vfs: Vfs, user: User, fault_handler: FaultHandler<Hook>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel();
        Self {
            mib,
            vfs,
            user,
            fault_handler,
            machines: HashMap::new(),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            next_seq_num: 0,
            stats: KernelStats::default(),
        }
    }

    pub fn mib(&self) -> &Mib {
        &self.mib
    }

    pub fn mib_mut(&mut self) -> &mut Mib {
        &mut self.mib
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_mut(&mut self) -> &mut User {
        &mut self.user
    }

    pub fn fault_handler(&self) -> &FaultHandler<Hook> {
        &self.fault_handler
    }

    pub fn fault_handler_mut(&mut self) -> &mut FaultHandler<Hook> {
        &mut self.fault_handler
    }

    pub fn stats(&self) -> KernelStats {
        self.stats
    }

    pub fn num_transactions(&self) -> usize {
        self.machines.len()
    }

    pub fn has_transaction(&self, id: &TransactionId) -> bool {
        self.machines.contains_key(id)
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.machines.keys().copied().collect()
    }

    /// Starts the transfer of `source_file` to `dest_file` at the destination entity.
    /// The transmission mode defaults to the one configured for the destination entity.
    pub fn put(
        &mut self,
        destination_id: impl Into<UnsignedByteField>,
        source_file: &str,
        dest_file: &str,
        trans_mode: Option<TransmissionMode>,
    ) -> Result<TransactionId, RequestError> {
        let put_request = PutRequest::new_regular_request(
            destination_id,
            source_file,
            dest_file,
            trans_mode,
            None,
        )?;
        self.put_request(put_request)
    }

    /// The request is validated completely before a sequence number is allocated. A rejected
    /// request leaves no transaction behind and emits no PDU.
    pub fn put_request(
        &mut self,
        mut put_request: PutRequest,
    ) -> Result<TransactionId, RequestError> {
        generic_path_checks(&put_request.source_file, &put_request.dest_file)?;
        let local_id = self.mib.local_entity_id();
        let destination_id = adapt_entity_id_width(put_request.destination_id, local_id.size())?;
        let trans_mode = match put_request.trans_mode {
            Some(trans_mode) => trans_mode,
            None => {
                self.mib
                    .remote_config(destination_id)
                    .default_transmission_mode
            }
        };
        if trans_mode == TransmissionMode::Acknowledged {
            return Err(RequestError::UnsupportedTransmissionMode(trans_mode));
        }
        let source_path = self.vfs.outgoing_path(&put_request.source_file)?;
        if !self.vfs.exists(&source_path) {
            return Err(RequestError::SourceFileMissing(put_request.source_file));
        }
        put_request.destination_id = destination_id;
        put_request.trans_mode = Some(trans_mode);

        let id = TransactionId::new(local_id, self.allocate_seq_num().into());
        let mut machine = Machine::Sender1(Sender1::new(id, destination_id));
        self.step_detached(&mut machine, Event::PutRequest(put_request))?;
        self.machines.insert(id, machine);
        self.stats.transactions_created += 1;
        Ok(id)
    }

    /// Returns a snapshot of the transaction and issues the report indication.
    pub fn report(&mut self, id: TransactionId) -> Result<TransactionReport, RequestError> {
        self.deliver(id, Event::ReportRequest)?;
        self.machines
            .get(&id)
            .map(Machine::report)
            .ok_or(RequestError::InvalidTransaction(id))
    }

    pub fn cancel(&mut self, id: TransactionId) -> Result<(), RequestError> {
        self.deliver(id, Event::CancelRequest)?;
        self.remove_if_finished(&id);
        Ok(())
    }

    pub fn suspend(&mut self, id: TransactionId) -> Result<(), RequestError> {
        self.deliver(id, Event::SuspendRequest)
    }

    pub fn resume(&mut self, id: TransactionId) -> Result<(), RequestError> {
        self.deliver(id, Event::ResumeRequest)
    }

    pub fn request(&mut self, request: Request) -> Result<RequestOutcome, RequestError> {
        match request {
            Request::Put(put_request) => self.put_request(put_request).map(RequestOutcome::Started),
            Request::Report(id) => self.report(id).map(RequestOutcome::Report),
            Request::Cancel(id) => self.cancel(id).map(|_| RequestOutcome::Delivered(id)),
            Request::Suspend(id) => self.suspend(id).map(|_| RequestOutcome::Delivered(id)),
            Request::Resume(id) => self.resume(id).map(|_| RequestOutcome::Delivered(id)),
        }
    }

    /// Freezes all transactions with the given remote entity. Returns the number of affected
    /// transactions.
    pub fn freeze(&mut self, remote_id: UnsignedByteField) -> usize {
        self.deliver_to_remote(remote_id, Event::Freeze)
    }

    pub fn thaw(&mut self, remote_id: UnsignedByteField) -> usize {
        self.deliver_to_remote(remote_id, Event::Thaw)
    }

    /// Enqueues a PDU on the outbound queue.
    pub fn send(&self, pdu: &Pdu) -> Result<(), KernelError> {
        self.outbound_tx
            .send_pdu(pdu.pdu_type(), pdu.file_directive_type(), pdu.raw_pdu())?;
        Ok(())
    }

    /// Sending half of the inbound queue, for transport readers.
    pub fn inbound_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbound_tx.clone()
    }

    /// Enqueues one raw PDU on the inbound queue.
    pub fn receive(&self, raw_pdu: Vec<u8>) -> Result<(), KernelError> {
        self.inbound_tx
            .send(raw_pdu)
            .map_err(|_| GenericSendError::RxDisconnected)?;
        Ok(())
    }

    pub fn next_outbound(&self) -> Option<PduOwnedWithInfo> {
        self.outbound_rx.try_recv().ok()
    }

    /// Handles the oldest PDU of the inbound queue. Returns [None] if the queue is empty.
    pub fn dispatch_inbound(&mut self) -> Option<DispatchOutcome> {
        let raw_pdu = self.inbound_rx.try_recv().ok()?;
        Some(self.handle_raw_pdu(&raw_pdu))
    }

    pub fn handle_raw_pdu(&mut self, raw_pdu: &[u8]) -> DispatchOutcome {
        let pdu = match Pdu::from_bytes(raw_pdu) {
            Ok(pdu) => pdu,
            Err(e) => {
                log::error!("dropping malformed PDU: {e}");
                self.stats.malformed += 1;
                return DispatchOutcome::DroppedMalformed;
            }
        };
        let conf = pdu.pdu_conf();
        let receiving_entity = match conf.direction {
            Direction::TowardsReceiver => conf.dest_id(),
            Direction::TowardsSender => conf.source_id(),
        };
        if receiving_entity.value() != self.mib.local_entity_id().value() {
            log::warn!(
                "dropping PDU addressed to entity {}",
                receiving_entity.value()
            );
            self.stats.not_for_us += 1;
            return DispatchOutcome::NotForUs;
        }

        let id = pdu.transaction_id();
        let event = match Event::from_pdu(pdu) {
            Ok(event) => event,
            Err(e) => {
                log::error!("dropping malformed PDU of transaction {id}: {e}");
                self.stats.malformed += 1;
                return DispatchOutcome::DroppedMalformed;
            }
        };
        let mut created = false;
        if !self.machines.contains_key(&id) {
            match &event {
                Event::MetadataPdu(pdu)
                    if pdu.pdu_conf().direction == Direction::TowardsReceiver =>
                {
                    let receiver = Receiver1::new(id, pdu.pdu_conf().source_id());
                    self.machines.insert(id, Machine::Receiver1(receiver));
                    self.stats.transactions_created += 1;
                    created = true;
                }
                _ => {
                    log::warn!("dropping {} for unknown transaction {id}", event.name());
                    self.stats.unrouted += 1;
                    return DispatchOutcome::DroppedUnrouted(id);
                }
            }
        } else if let Some(machine) = self.machines.get_mut(&id) {
            let timer = machine.inactivity_timer_mut();
            if timer.state() == TimerState::Running {
                timer.restart();
            }
        }

        self.stats.pdus_dispatched += 1;
        let result = self.step(&id, event);
        self.remove_if_finished(&id);
        match result {
            Some(Err(e)) => {
                log::error!("transaction {id}: handling PDU failed: {e}");
                self.stats.machine_errors += 1;
                DispatchOutcome::Failed(id)
            }
            _ if created => DispatchOutcome::Created(id),
            _ => DispatchOutcome::Routed(id),
        }
    }

    /// Visits every machine once. Machines with an expired inactivity timer receive the
    /// expiry event. Sending machines are asked for one file directive and then for one file
    /// segment. Finished machines are removed from the table.
    pub fn tick(&mut self) {
        for id in self.transaction_ids() {
            let (expired, role) = match self.machines.get_mut(&id) {
                Some(machine) => {
                    let expired = machine.inactivity_timer().expired();
                    if expired {
                        machine.inactivity_timer_mut().cancel();
                    }
                    (expired, machine.role())
                }
                None => continue,
            };
            let events = if expired {
                vec![Event::InactivityTimerExpired]
            } else if role == EntityType::Sending {
                vec![Event::SendFileDirective, Event::SendFileData]
            } else {
                Vec::new()
            };
            for event in events {
                let name = event.name();
                if let Some(Err(e)) = self.step(&id, event) {
                    log::error!("transaction {id}: {name} failed: {e}");
                    self.stats.machine_errors += 1;
                }
            }
            self.remove_if_finished(&id);
        }
    }

    fn allocate_seq_num(&mut self) -> UnsignedByteFieldU32 {
        let seq_num = self.next_seq_num;
        self.next_seq_num = seq_num.wrapping_add(1);
        UnsignedByteFieldU32::new(seq_num)
    }

    fn deliver(&mut self, id: TransactionId, event: Event) -> Result<(), RequestError> {
        match self.step(&id, event) {
            Some(result) => result.map_err(RequestError::from),
            None => Err(RequestError::InvalidTransaction(id)),
        }
    }

    fn deliver_to_remote(&mut self, remote_id: UnsignedByteField, event: Event) -> usize {
        let ids: Vec<TransactionId> = self
            .machines
            .iter()
            .filter(|(_, machine)| machine.transaction().remote_id().value() == remote_id.value())
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(Err(e)) = self.step(id, event.clone()) {
                log::error!("transaction {id}: {} failed: {e}", event.name());
            }
        }
        ids.len()
    }

    /// Returns [None] if no machine exists for the transaction.
    fn step(&mut self, id: &TransactionId, event: Event) -> Option<Result<(), MachineError>> {
        let machine = self.machines.get_mut(id)?;
        let mut ctx = MachineContext {
            mib: &mut self.mib,
            vfs: &self.vfs,
            user: &mut self.user,
            fault_handler: &self.fault_handler,
            pdu_sender: &self.outbound_tx,
        };
        Some(machine.update_state(event, &mut ctx))
    }

    fn step_detached(&mut self, machine: &mut Machine, event: Event) -> Result<(), MachineError> {
        let mut ctx = MachineContext {
            mib: &mut self.mib,
            vfs: &self.vfs,
            user: &mut self.user,
            fault_handler: &self.fault_handler,
            pdu_sender: &self.outbound_tx,
        };
        machine.update_state(event, &mut ctx)
    }

    fn remove_if_finished(&mut self, id: &TransactionId) {
        if self.machines.get(id).is_some_and(Machine::is_finished) {
            self.machines.remove(id);
            self.stats.transactions_finished += 1;
            log::debug!("transaction {id} removed");
        }
    }
}

/// Entity IDs of one PDU header share one width, so the destination ID of a put request is
/// converted to the width of the local entity ID.
fn adapt_entity_id_width(
    id: UnsignedByteField,
    width: usize,
) -> Result<UnsignedByteField, RequestError> {
    if id.size() == width {
        return Ok(id);
    }
    let fits = width >= 8 || id.value() < (1u64 << (width * 8));
    if !fits {
        return Err(RequestError::EntityIdWidthMismatch {
            expected: width,
            found: id.size(),
        });
    }
    Ok(UnsignedByteField::new(width, id.value()))
}
