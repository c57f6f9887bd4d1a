//! Runs one CFDP entity which exchanges PDUs with its peer through a relay directory, one file
//! per PDU.
//!
//! Two instances with swapped IDs and the same relay directory can copy files to each other:
//!
//! ```sh
//! cargo run --example directory-relay -- \
//!     --local-id 2 --remote-id 1 --root /tmp/rx --relay /tmp/relay
//! cargo run --example directory-relay -- \
//!     --local-id 1 --remote-id 2 --root /tmp/tx --relay /tmp/relay --put a.txt:b.txt
//! ```
use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use cfdp_engine::{
    filestore::NativeFilestore,
    kernel::Kernel,
    mib::{Mib, MibValue},
    scheduler::{spawn_engine, SchedulerConfig},
    transport::DirectoryTransport,
    user::LoggingUser,
    FaultHandler, LoggingFaultHook,
};
use clap::Parser;
use log::{error, info};
use spacepackets::util::UnsignedByteFieldU16;

#[derive(Debug, Parser)]
#[command(about = "CFDP entity exchanging PDUs through a relay directory")]
struct Cli {
    #[arg(long, default_value_t = 1)]
    local_id: u16,
    #[arg(long, default_value_t = 2)]
    remote_id: u16,
    /// Filestore root for outgoing and incoming files.
    #[arg(long)]
    root: PathBuf,
    /// Directory holding the PDU files of both entities.
    #[arg(long)]
    relay: PathBuf,
    /// Optional staging directory for received metadata and EOF PDUs.
    #[arg(long)]
    staging: Option<PathBuf>,
    /// MIB document created with `Mib::dump_to_file`.
    #[arg(long)]
    mib: Option<PathBuf>,
    /// Segment length towards the remote entity.
    #[arg(long)]
    segment_len: Option<u64>,
    /// File to send, as `source:destination` relative to the filestore roots.
    #[arg(long)]
    put: Option<String>,
    /// Time to keep running after the put transaction finished, or in total without put.
    #[arg(long, default_value_t = 30)]
    run_secs: u64,
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logger(verbose: bool) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                std::thread::current().name().unwrap_or("main"),
                record.level(),
                message
            ))
        })
        .level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .chain(std::io::stdout())
        .apply()
}

fn main() {
    let cli = Cli::parse();
    setup_logger(cli.verbose).expect("setting up logger failed");

    let local_id = UnsignedByteFieldU16::new(cli.local_id);
    let remote_id = UnsignedByteFieldU16::new(cli.remote_id);
    let mut mib = match &cli.mib {
        Some(path) => Mib::load_from_file(path).expect("loading MIB failed"),
        None => Mib::new(local_id),
    };
    mib.set_local("local_entity_id", MibValue::EntityId(local_id.into()))
        .expect("setting local entity ID failed");
    if let Some(segment_len) = cli.segment_len {
        mib.set_remote(
            remote_id.into(),
            "max_file_segment_length",
            MibValue::Int(segment_len),
        )
        .expect("setting segment length failed");
    }

    let vfs = NativeFilestore::new(&cli.root, &cli.root, cli.staging.clone());
    let kernel = Kernel::new(
        mib,
        vfs,
        LoggingUser::default(),
        FaultHandler::new(LoggingFaultHook::default()),
    );
    let receiver = DirectoryTransport::new(&cli.relay, &cli.relay, local_id.into())
        .expect("creating relay receiver failed");
    let transmitter = DirectoryTransport::new(&cli.relay, &cli.relay, local_id.into())
        .expect("creating relay transmitter failed");
    let engine = spawn_engine(kernel, receiver, transmitter, SchedulerConfig::default())
        .expect("spawning engine failed");
    info!(
        "entity {} running, relay directory {}",
        cli.local_id,
        cli.relay.display()
    );

    if let Some(put) = &cli.put {
        let (source, dest) = put.split_once(':').unwrap_or((put.as_str(), put.as_str()));
        match engine.with_kernel(|kernel| kernel.put(remote_id, source, dest, None)) {
            Ok(id) => {
                info!("put request accepted, transaction {id}");
                while engine.with_kernel(|kernel| kernel.has_transaction(&id)) {
                    thread::sleep(Duration::from_millis(100));
                }
            }
            Err(e) => error!("put request rejected: {e}"),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(cli.run_secs);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(200));
    }
    let stats = engine.with_kernel(|kernel| kernel.stats());
    info!("stopping, {stats:?}");
    engine.join();
}
