//! # CFDP Packet Data Unit (PDU) handling
//!
//! The wire format of the Metadata, File Data, EOF, Finished, ACK and NAK PDUs is provided by
//! the creators and readers of the [spacepackets::cfdp::pdu] module. This module adds:
//!
//! - the Prompt and Keep Alive PDUs in [prompt] and [keep_alive],
//! - the owned [Pdu] type which is moved through the queues and machines of the engine. It is
//!   only created from a fully validated raw PDU, so the PDU data field length inside the header
//!   always matches the encoded body, including the CRC trailer if the CRC flag is set,
//! - the borrowed [PduBody] view which exposes the typed reader of each PDU.
//!
//! Decoding an unknown directive code, a truncated buffer or a buffer with a wrong CRC fails
//! with a [PduError].
use spacepackets::{
    cfdp::{lv::Lv, CrcFlag, LargeFileFlag, PduType},
    ByteConversionError, CRC_CCITT_FALSE,
};

use crate::{PacketTarget, TransactionId};

pub mod keep_alive;
pub mod prompt;

pub use keep_alive::KeepAlivePdu;
pub use prompt::{PromptPdu, PromptResponse};
pub use spacepackets::cfdp::pdu::{
    ack::AckPdu,
    eof::EofPdu,
    file_data::FileDataPdu,
    finished::{DeliveryCode, FileStatus, FinishedPduCreator, FinishedPduReader},
    metadata::{MetadataGenericParams, MetadataPduCreator, MetadataPduReader},
    nak::{NakPduCreator, NakPduReader},
    CfdpPdu, CommonPduConfig, FileDirectiveType, PduError, PduHeader, WritablePduPacket,
};

pub const CRC_LEN: usize = 2;

/// Data field length of a file directive PDU whose parameters occupy `params_len` octets.
pub(crate) fn directive_datafield_len(crc_flag: CrcFlag, params_len: usize) -> u16 {
    let mut len = 1 + params_len;
    if crc_flag == CrcFlag::WithCrc {
        len += CRC_LEN;
    }
    len as u16
}

/// Checks the directive code of a hand-written directive PDU and the minimal parameter length.
/// Returns the index of the first parameter octet.
pub(crate) fn check_directive(
    buf: &[u8],
    header_len: usize,
    full_len_without_crc: usize,
    expected: FileDirectiveType,
    min_params_len: usize,
) -> Result<usize, PduError> {
    let min_len = header_len + 1 + min_params_len;
    if full_len_without_crc < min_len {
        return Err(ByteConversionError::FromSliceTooSmall {
            found: full_len_without_crc,
            expected: min_len,
        }
        .into());
    }
    let raw_directive = buf[header_len];
    let found = FileDirectiveType::try_from(raw_directive).map_err(|_| {
        PduError::InvalidDirectiveType {
            found: raw_directive,
            expected: Some(expected),
        }
    })?;
    if found != expected {
        return Err(PduError::WrongDirectiveType { found, expected });
    }
    Ok(header_len + 1)
}

pub(crate) fn fss_len(file_flag: LargeFileFlag) -> usize {
    match file_flag {
        LargeFileFlag::Normal => 4,
        LargeFileFlag::Large => 8,
    }
}

pub(crate) fn write_fss(
    buf: &mut [u8],
    file_flag: LargeFileFlag,
    value: u64,
) -> Result<usize, PduError> {
    match file_flag {
        LargeFileFlag::Normal => {
            let value = u32::try_from(value).map_err(|_| PduError::FileSizeTooLarge(value))?;
            buf[..4].copy_from_slice(&value.to_be_bytes());
        }
        LargeFileFlag::Large => buf[..8].copy_from_slice(&value.to_be_bytes()),
    }
    Ok(fss_len(file_flag))
}

pub(crate) fn read_fss(buf: &[u8], file_flag: LargeFileFlag) -> u64 {
    buf[..fss_len(file_flag)]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
}

/// Appends the CRC-16/CCITT-FALSE trailer if the CRC flag is set.
pub(crate) fn add_crc_if_enabled(crc_flag: CrcFlag, buf: &mut [u8], current_idx: usize) -> usize {
    if crc_flag == CrcFlag::NoCrc {
        return current_idx;
    }
    let crc = CRC_CCITT_FALSE.checksum(&buf[..current_idx]);
    buf[current_idx..current_idx + CRC_LEN].copy_from_slice(&crc.to_be_bytes());
    current_idx + CRC_LEN
}

pub(crate) fn ensure_buf_len(buf: &[u8], expected: usize) -> Result<(), PduError> {
    if buf.len() < expected {
        return Err(ByteConversionError::ToSliceTooSmall {
            found: buf.len(),
            expected,
        }
        .into());
    }
    Ok(())
}

/// File name carried inside an LV. An empty LV yields an empty name.
///
/// Names which are not valid UTF-8 are rejected by [Pdu::from_bytes], so they also yield an
/// empty name here.
pub fn lv_file_name<'name>(lv: &Lv<'name>) -> &'name str {
    lv.value_as_str().and_then(Result::ok).unwrap_or_default()
}

/// Typed view on the body of a [Pdu]. The readers borrow the raw PDU.
#[derive(Debug)]
pub enum PduBody<'raw> {
    Metadata(MetadataPduReader<'raw>),
    FileData(FileDataPdu<'raw, 'raw>),
    Eof(EofPdu),
    Finished(FinishedPduReader<'raw>),
    Ack(AckPdu),
    Nak(NakPduReader<'raw>),
    Prompt(PromptPdu),
    KeepAlive(KeepAlivePdu),
}

/// A complete and validated PDU. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    header: PduHeader,
    file_directive_type: Option<FileDirectiveType>,
    packet_target: PacketTarget,
    raw: Vec<u8>,
}

impl Pdu {
    /// Serializes one of the PDU creators and keeps the result.
    pub fn new(pdu: &(impl WritablePduPacket + CfdpPdu)) -> Result<Self, PduError> {
        Self::from_bytes(&pdu.to_vec()?)
    }

    /// Decodes one PDU from the start of the buffer. Bytes after the length announced by the
    /// header are ignored. Metadata PDUs with file names which are not valid UTF-8 are rejected
    /// with [PduError::FormatError].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, header_len) = PduHeader::from_bytes(buf)?;
        header.verify_length_and_checksum(buf)?;
        let file_directive_type = match header.pdu_type() {
            PduType::FileData => None,
            PduType::FileDirective => {
                if header.pdu_datafield_len() < 1 {
                    return Err(ByteConversionError::FromSliceTooSmall {
                        found: header.pdu_len(),
                        expected: header_len + 1,
                    }
                    .into());
                }
                let raw_directive = buf[header_len];
                Some(FileDirectiveType::try_from(raw_directive).map_err(|_| {
                    PduError::InvalidDirectiveType {
                        found: raw_directive,
                        expected: None,
                    }
                })?)
            }
        };
        let mut pdu = Self {
            header,
            file_directive_type,
            packet_target: PacketTarget::DestEntity,
            raw: buf[..header.pdu_len()].to_vec(),
        };
        let body = pdu.body()?;
        if let PduBody::Metadata(metadata) = &body {
            for name in [metadata.src_file_name(), metadata.dest_file_name()] {
                if let Some(Err(_)) = name.value_as_str() {
                    return Err(PduError::FormatError);
                }
            }
        }
        // Section 4.5.3 of the standard.
        let packet_target = match body {
            PduBody::Nak(_) | PduBody::Finished(_) | PduBody::KeepAlive(_) => {
                PacketTarget::SourceEntity
            }
            PduBody::Metadata(_) | PduBody::FileData(_) | PduBody::Eof(_) | PduBody::Prompt(_) => {
                PacketTarget::DestEntity
            }
            PduBody::Ack(ack) => match ack.directive_code_of_acked_pdu() {
                FileDirectiveType::EofPdu => PacketTarget::SourceEntity,
                _ => PacketTarget::DestEntity,
            },
        };
        pdu.packet_target = packet_target;
        Ok(pdu)
    }

    /// Parses the body with the reader matching the PDU type.
    pub fn body(&self) -> Result<PduBody<'_>, PduError> {
        let raw = self.raw.as_slice();
        let directive = match self.file_directive_type {
            None => return Ok(PduBody::FileData(FileDataPdu::from_bytes(raw)?)),
            Some(directive) => directive,
        };
        Ok(match directive {
            FileDirectiveType::MetadataPdu => PduBody::Metadata(MetadataPduReader::new(raw)?),
            FileDirectiveType::EofPdu => PduBody::Eof(EofPdu::from_bytes(raw)?),
            FileDirectiveType::FinishedPdu => PduBody::Finished(FinishedPduReader::new(raw)?),
            FileDirectiveType::AckPdu => PduBody::Ack(AckPdu::from_bytes(raw)?),
            FileDirectiveType::NakPdu => PduBody::Nak(NakPduReader::new(raw)?),
            FileDirectiveType::PromptPdu => PduBody::Prompt(PromptPdu::from_bytes(raw)?),
            FileDirectiveType::KeepAlivePdu => PduBody::KeepAlive(KeepAlivePdu::from_bytes(raw)?),
        })
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    pub fn pdu_conf(&self) -> &CommonPduConfig {
        self.header.common_pdu_conf()
    }

    pub fn pdu_type(&self) -> PduType {
        self.header.pdu_type()
    }

    pub fn file_directive_type(&self) -> Option<FileDirectiveType> {
        self.file_directive_type
    }

    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::from(self.pdu_conf())
    }

    /// Classification according to the PDU forwarding rules of section 4.5 of the standard.
    pub fn packet_target(&self) -> PacketTarget {
        self.packet_target
    }

    /// Always equal to the length of [Self::raw_pdu].
    pub fn len_written(&self) -> usize {
        self.raw.len()
    }

    pub fn raw_pdu(&self) -> &[u8] {
        &self.raw
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.raw.clone()
    }
}
