//! Keep Alive PDU, see CFDP chapter 5.2.8.
use spacepackets::cfdp::{pdu::CommonPduConfig, Direction};

use super::{
    add_crc_if_enabled, check_directive, directive_datafield_len, ensure_buf_len, fss_len,
    read_fss, write_fss, CfdpPdu, FileDirectiveType, PduError, PduHeader, WritablePduPacket,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeepAlivePdu {
    pdu_header: PduHeader,
    progress: u64,
}

impl KeepAlivePdu {
    /// The progress must fit into 32 bits unless the large file flag is set, otherwise
    /// serialization fails with [PduError::FileSizeTooLarge].
    pub fn new(mut pdu_conf: CommonPduConfig, progress: u64) -> Self {
        pdu_conf.direction = Direction::TowardsSender;
        let datafield_len = directive_datafield_len(pdu_conf.crc_flag, fss_len(pdu_conf.file_flag));
        Self {
            pdu_header: PduHeader::new_no_file_data(pdu_conf, datafield_len),
            progress,
        }
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, header_len) = PduHeader::from_bytes(buf)?;
        let full_len_without_crc = pdu_header.verify_length_and_checksum(buf)?;
        let file_flag = pdu_header.common_pdu_conf().file_flag;
        let idx = check_directive(
            buf,
            header_len,
            full_len_without_crc,
            FileDirectiveType::KeepAlivePdu,
            fss_len(file_flag),
        )?;
        Ok(Self {
            pdu_header,
            progress: read_fss(&buf[idx..], file_flag),
        })
    }
}

impl CfdpPdu for KeepAlivePdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::KeepAlivePdu)
    }
}

impl WritablePduPacket for KeepAlivePdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        ensure_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::KeepAlivePdu as u8;
        current_idx += 1;
        current_idx += write_fss(&mut buf[current_idx..], self.file_flag(), self.progress)?;
        Ok(add_crc_if_enabled(self.crc_flag(), buf, current_idx))
    }
}
