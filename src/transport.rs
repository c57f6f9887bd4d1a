//! Transport adapters.
//!
//! The engine only needs two things from a transport: one raw PDU per received item and a way
//! to hand over one encoded PDU. [PduReceiver] and [PduTransmitter] describe those two halves.
//! Framing is the job of the adapter:
//!
//! - [mpsc] channel ends carry one PDU per message.
//! - [UdpTransport] carries one PDU per datagram.
//! - [DirectoryTransport] carries one PDU per file.
use std::{
    fs,
    io::{self, ErrorKind},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    path::{Path, PathBuf},
    sync::mpsc,
};

use spacepackets::util::{UnsignedByteField, UnsignedEnum};

use crate::{pdu::PduError, PduOwnedWithInfo};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),
    #[error("transport peer disconnected")]
    Disconnected,
}

pub trait PduReceiver {
    /// Returns the next raw PDU or [None] if nothing is available right now. Must not block
    /// for longer than one polling interval.
    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

pub trait PduTransmitter {
    fn transmit(&mut self, pdu: &PduOwnedWithInfo) -> Result<(), TransportError>;
}

impl PduReceiver for mpsc::Receiver<Vec<u8>> {
    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.try_recv() {
            Ok(raw_pdu) => Ok(Some(raw_pdu)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

impl PduTransmitter for mpsc::Sender<Vec<u8>> {
    fn transmit(&mut self, pdu: &PduOwnedWithInfo) -> Result<(), TransportError> {
        self.send(pdu.pdu.clone())
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Non-blocking UDP socket exchanging PDUs with one remote address.
pub struct UdpTransport {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
    remote_addr: SocketAddr,
}

impl UdpTransport {
    pub fn new<A: ToSocketAddrs>(
        addr: A,
        remote_addr: SocketAddr,
        max_recv_size: usize,
    ) -> Result<Self, io::Error> {
        let transport = Self {
            socket: UdpSocket::bind(addr)?,
            recv_buf: vec![0; max_recv_size],
            remote_addr,
        };
        transport.socket.set_nonblocking(true)?;
        Ok(transport)
    }

    /// Second handle on the same socket, so reading and writing can happen on different
    /// threads.
    pub fn try_clone(&self) -> Result<Self, io::Error> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            recv_buf: vec![0; self.recv_buf.len()],
            remote_addr: self.remote_addr,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl PduReceiver for UdpTransport {
    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(res) => res,
            Err(e) => {
                return if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut {
                    Ok(None)
                } else {
                    Err(e.into())
                };
            }
        };
        log::trace!("received {len} bytes from {from}");
        Ok(Some(self.recv_buf[..len].to_vec()))
    }
}

impl PduTransmitter for UdpTransport {
    fn transmit(&mut self, pdu: &PduOwnedWithInfo) -> Result<(), TransportError> {
        self.socket.send_to(&pdu.pdu, self.remote_addr)?;
        Ok(())
    }
}

const TMP_SUFFIX: &str = ".tmp";
const BAD_SUFFIX: &str = ".bad";

/// PDU-per-file relay over two directories.
///
/// Received PDUs are read from files named `{local_entity_id}_*` in the inbox, oldest name
/// first, and deleted afterwards. Sent PDUs are written to the outbox as
/// `{receiving_entity_id}_{local_entity_id}_{counter}`. Files are written under a temporary
/// name and renamed, so a reader never sees a partial PDU. An inbox file which cannot be read
/// or deleted is renamed to `*.bad` and skipped from then on.
#[derive(Debug)]
pub struct DirectoryTransport {
    inbox: PathBuf,
    outbox: PathBuf,
    local_id: u64,
    counter: u64,
}

impl DirectoryTransport {
    pub fn new(
        inbox: impl Into<PathBuf>,
        outbox: impl Into<PathBuf>,
        local_id: UnsignedByteField,
    ) -> Result<Self, io::Error> {
        let transport = Self {
            inbox: inbox.into(),
            outbox: outbox.into(),
            local_id: local_id.value(),
            counter: 0,
        };
        fs::create_dir_all(&transport.inbox)?;
        fs::create_dir_all(&transport.outbox)?;
        Ok(transport)
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn next_inbox_file(&self) -> Result<Option<PathBuf>, io::Error> {
        let prefix = format!("{}_", self.local_id);
        let mut oldest: Option<(String, PathBuf)> = None;
        for entry in fs::read_dir(&self.inbox)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !name.starts_with(&prefix)
                || name.ends_with(TMP_SUFFIX)
                || name.ends_with(BAD_SUFFIX)
                || entry.file_type()?.is_dir()
            {
                continue;
            }
            if oldest.as_ref().map_or(true, |(oldest_name, _)| name < *oldest_name) {
                oldest = Some((name, entry.path()));
            }
        }
        Ok(oldest.map(|(_, path)| path))
    }
}

impl PduReceiver for DirectoryTransport {
    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let path = match self.next_inbox_file()? {
            Some(path) => path,
            None => return Ok(None),
        };
        let raw_pdu = match fs::read(&path).and_then(|raw| fs::remove_file(&path).map(|_| raw)) {
            Ok(raw_pdu) => raw_pdu,
            Err(e) => {
                log::error!("reading PDU file {} failed: {e}", path.display());
                move_aside(&path);
                return Err(e.into());
            }
        };
        log::debug!("read PDU file {}", path.display());
        Ok(Some(raw_pdu))
    }
}

fn move_aside(path: &Path) {
    let mut bad_path = path.as_os_str().to_owned();
    bad_path.push(BAD_SUFFIX);
    if let Err(e) = fs::rename(path, &bad_path) {
        log::error!("moving {} aside failed: {e}", path.display());
    }
}

impl PduTransmitter for DirectoryTransport {
    fn transmit(&mut self, pdu: &PduOwnedWithInfo) -> Result<(), TransportError> {
        let target = pdu.receiving_entity_id()?.value();
        let name = format!("{}_{}_{:010}", target, self.local_id, self.counter);
        self.counter += 1;
        let tmp_path = self.outbox.join(format!(".{name}{TMP_SUFFIX}"));
        fs::write(&tmp_path, &pdu.pdu)?;
        fs::rename(&tmp_path, self.outbox.join(&name))?;
        log::debug!("wrote PDU file {name}");
        Ok(())
    }
}
