//! End-to-end integration tests: two engines exchange a file through a transport.
use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, Once,
    },
    thread,
    time::{Duration, Instant},
};

use cfdp_engine::{
    filestore::NativeFilestore,
    kernel::Kernel,
    mib::{Mib, MibValue},
    pdu::{DeliveryCode, FileStatus},
    scheduler::{spawn_engine, EngineHandle, SchedulerConfig},
    transport::{DirectoryTransport, PduReceiver, PduTransmitter},
    user::{
        CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams,
        TransactionReport,
    },
    EntityType, FaultHandler, TransactionId, UserFaultHook,
};
use rand::RngCore;
use spacepackets::{
    cfdp::{ChecksumType, ConditionCode},
    util::UnsignedByteFieldU16,
};

const LOCAL_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const REMOTE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

const FILE_SIZE: usize = 5000;
const TIMEOUT: Duration = Duration::from_secs(10);

static LOGGER: Once = Once::new();

fn setup_logger() {
    LOGGER.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    std::thread::current().name().unwrap_or("main"),
                    record.level(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply();
    });
}

#[derive(Default)]
pub struct ExampleFaultHandler {}

impl UserFaultHook for ExampleFaultHandler {
    fn notice_of_suspension_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        panic!(
            "unexpected suspension of transaction {}, condition code {:?}, progress {}",
            transaction_id, cond, progress
        );
    }

    fn notice_of_cancellation_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    ) {
        panic!(
            "unexpected cancellation of transaction {}, condition code {:?}, progress {}",
            transaction_id, cond, progress
        );
    }

    fn abandoned_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        panic!(
            "unexpected abandonment of transaction {}, condition code {:?}, progress {}",
            transaction_id, cond, progress
        );
    }

    fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
        panic!(
            "ignoring unexpected error in transaction {}, condition code {:?}, progress {}",
            transaction_id, cond, progress
        );
    }
}

pub struct ExampleCfdpUser {
    entity_type: EntityType,
    completion_signal: Arc<AtomicBool>,
    finished: Arc<Mutex<Vec<TransactionFinishedParams>>>,
}

impl ExampleCfdpUser {
    pub fn new(
        entity_type: EntityType,
        completion_signal: Arc<AtomicBool>,
        finished: Arc<Mutex<Vec<TransactionFinishedParams>>>,
    ) -> Self {
        Self {
            entity_type,
            completion_signal,
            finished,
        }
    }
}

impl CfdpUser for ExampleCfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId) {
        log::info!("{:?} entity: transaction indication for {}", self.entity_type, id);
    }

    fn eof_sent_indication(&mut self, id: &TransactionId) {
        log::info!("{:?} entity: EOF sent for transaction {}", self.entity_type, id);
    }

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
        log::info!(
            "{:?} entity: transaction finished: {:?}",
            self.entity_type,
            finished_params
        );
        self.finished
            .lock()
            .expect("finished lock poisoned")
            .push(*finished_params);
        self.completion_signal.store(true, Ordering::Relaxed);
    }

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
        log::info!(
            "{:?} entity: metadata received: {:?}",
            self.entity_type,
            md_recvd_params
        );
    }

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams) {
        log::debug!(
            "{:?} entity: file segment {:?} received",
            self.entity_type,
            segment_recvd_params
        );
    }

    fn report_indication(&mut self, _report: &TransactionReport) {}

    fn suspended_indication(&mut self, _id: &TransactionId, _condition_code: ConditionCode) {
        panic!("unexpected suspended indication");
    }

    fn resumed_indication(&mut self, _id: &TransactionId, _progress: u64) {}

    fn fault_indication(
        &mut self,
        _id: &TransactionId,
        _condition_code: ConditionCode,
        _progress: u64,
    ) {
        panic!("unexpected fault indication");
    }

    fn abandoned_indication(
        &mut self,
        _id: &TransactionId,
        _condition_code: ConditionCode,
        _progress: u64,
    ) {
        panic!("unexpected abandoned indication");
    }

    fn eof_recvd_indication(&mut self, id: &TransactionId) {
        log::info!("{:?} entity: EOF received for transaction {}", self.entity_type, id);
    }
}

type ExampleEngine = EngineHandle<NativeFilestore, ExampleCfdpUser, ExampleFaultHandler>;

struct Entity {
    engine: ExampleEngine,
    completion_signal: Arc<AtomicBool>,
    finished: Arc<Mutex<Vec<TransactionFinishedParams>>>,
}

fn spawn_entity(
    local_id: UnsignedByteFieldU16,
    peer_id: UnsignedByteFieldU16,
    entity_type: EntityType,
    root: &Path,
    with_closure: bool,
    receiver: impl PduReceiver + Send + 'static,
    transmitter: impl PduTransmitter + Send + 'static,
) -> Entity {
    let mut mib = Mib::new(local_id);
    mib.set_remote(peer_id.into(), "max_file_segment_length", MibValue::Int(1024))
        .expect("setting segment length failed");
    mib.set_remote(peer_id.into(), "closure_requested", MibValue::Bool(with_closure))
        .expect("setting closure failed");
    mib.set_remote(
        peer_id.into(),
        "default_checksum_type",
        MibValue::ChecksumType(ChecksumType::Crc32),
    )
    .expect("setting checksum type failed");
    let completion_signal = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(Mutex::new(Vec::new()));
    let kernel = Kernel::new(
        mib,
        NativeFilestore::new_with_single_root(root),
        ExampleCfdpUser::new(entity_type, completion_signal.clone(), finished.clone()),
        FaultHandler::new(ExampleFaultHandler::default()),
    );
    let cfg = SchedulerConfig {
        idle_sleep: Duration::from_millis(2),
        tick_interval: Duration::from_millis(2),
    };
    let engine = spawn_engine(kernel, receiver, transmitter, cfg).expect("spawning engine failed");
    Entity {
        engine,
        completion_signal,
        finished,
    }
}

fn random_file(path: &Path) -> Vec<u8> {
    let mut data = vec![0; FILE_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    fs::write(path, &data).expect("writing source file failed");
    data
}

fn wait_for_completion(source: &Entity, dest: &Entity) {
    let start = Instant::now();
    while !(source.completion_signal.load(Ordering::Relaxed)
        && dest.completion_signal.load(Ordering::Relaxed))
    {
        if start.elapsed() > TIMEOUT {
            panic!("file transfer not finished in {TIMEOUT:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn check_completed_transfer(source: Entity, dest: Entity, id: TransactionId) {
    let source_finished = source.finished.lock().unwrap().clone();
    let dest_finished = dest.finished.lock().unwrap().clone();
    assert_eq!(source_finished.len(), 1);
    assert_eq!(dest_finished.len(), 1);
    assert_eq!(source_finished[0].id, id);
    assert_eq!(dest_finished[0].id, id);
    assert_eq!(dest_finished[0].condition_code, ConditionCode::NoError);
    assert_eq!(dest_finished[0].delivery_code, DeliveryCode::Complete);
    assert_eq!(dest_finished[0].file_status, FileStatus::Retained);
    let dest_stats = dest.engine.with_kernel(|kernel| kernel.stats());
    assert_eq!(dest_stats.transactions_created, 1);
    assert_eq!(dest_stats.transactions_finished, 1);
    assert_eq!(dest_stats.malformed, 0);
    // Metadata, five file data PDUs and EOF.
    assert_eq!(dest_stats.pdus_dispatched, 7);
    source.engine.join();
    dest.engine.join();
}

fn end_to_end_test(with_closure: bool) {
    setup_logger();
    let source_root = tempfile::tempdir().expect("creating temp directory failed");
    let dest_root = tempfile::tempdir().expect("creating temp directory failed");
    let data = random_file(&source_root.path().join("src.bin"));

    let (source_to_dest_tx, source_to_dest_rx) = mpsc::channel::<Vec<u8>>();
    let (dest_to_source_tx, dest_to_source_rx) = mpsc::channel::<Vec<u8>>();
    let source = spawn_entity(
        LOCAL_ID,
        REMOTE_ID,
        EntityType::Sending,
        source_root.path(),
        with_closure,
        dest_to_source_rx,
        source_to_dest_tx,
    );
    let dest = spawn_entity(
        REMOTE_ID,
        LOCAL_ID,
        EntityType::Receiving,
        dest_root.path(),
        with_closure,
        source_to_dest_rx,
        dest_to_source_tx,
    );

    let id = source
        .engine
        .with_kernel(|kernel| kernel.put(REMOTE_ID, "src.bin", "nested/dest.bin", None))
        .expect("put request failed");
    wait_for_completion(&source, &dest);
    let received = fs::read(dest_root.path().join("nested/dest.bin")).expect("reading file failed");
    assert_eq!(received, data);
    if with_closure {
        // The finished PDU reaches the sender after its transaction is gone and is dropped.
        let start = Instant::now();
        while source.engine.with_kernel(|kernel| kernel.stats().unrouted) == 0 {
            assert!(start.elapsed() < TIMEOUT, "finished PDU did not arrive");
            thread::sleep(Duration::from_millis(10));
        }
    }
    check_completed_transfer(source, dest, id);
}

#[test]
fn end_to_end_test_no_closure() {
    end_to_end_test(false);
}

#[test]
fn end_to_end_test_with_closure() {
    end_to_end_test(true);
}

#[test]
fn end_to_end_test_directory_relay() {
    setup_logger();
    let source_root = tempfile::tempdir().expect("creating temp directory failed");
    let dest_root = tempfile::tempdir().expect("creating temp directory failed");
    let relay = tempfile::tempdir().expect("creating temp directory failed");
    let data = random_file(&source_root.path().join("src.bin"));

    let source_transport = || {
        DirectoryTransport::new(relay.path(), relay.path(), LOCAL_ID.into())
            .expect("creating directory transport failed")
    };
    let dest_transport = || {
        DirectoryTransport::new(relay.path(), relay.path(), REMOTE_ID.into())
            .expect("creating directory transport failed")
    };
    let source = spawn_entity(
        LOCAL_ID,
        REMOTE_ID,
        EntityType::Sending,
        source_root.path(),
        false,
        source_transport(),
        source_transport(),
    );
    let dest = spawn_entity(
        REMOTE_ID,
        LOCAL_ID,
        EntityType::Receiving,
        dest_root.path(),
        false,
        dest_transport(),
        dest_transport(),
    );
    let id = source
        .engine
        .with_kernel(|kernel| kernel.put(REMOTE_ID, "src.bin", "dest.bin", None))
        .expect("put request failed");
    wait_for_completion(&source, &dest);
    assert_eq!(
        fs::read(dest_root.path().join("dest.bin")).expect("reading file failed"),
        data
    );
    check_completed_transfer(source, dest, id);
}
