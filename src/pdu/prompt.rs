//! Prompt PDU, see CFDP chapter 5.2.7.
use spacepackets::cfdp::{pdu::CommonPduConfig, Direction};

use super::{
    add_crc_if_enabled, check_directive, directive_datafield_len, ensure_buf_len, CfdpPdu,
    FileDirectiveType, PduError, PduHeader, WritablePduPacket,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PromptResponse {
    Nak = 0,
    KeepAlive = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PromptPdu {
    pdu_header: PduHeader,
    response_required: PromptResponse,
}

impl PromptPdu {
    pub fn new(mut pdu_conf: CommonPduConfig, response_required: PromptResponse) -> Self {
        pdu_conf.direction = Direction::TowardsReceiver;
        let datafield_len = directive_datafield_len(pdu_conf.crc_flag, 1);
        Self {
            pdu_header: PduHeader::new_no_file_data(pdu_conf, datafield_len),
            response_required,
        }
    }

    pub fn response_required(&self) -> PromptResponse {
        self.response_required
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, header_len) = PduHeader::from_bytes(buf)?;
        let full_len_without_crc = pdu_header.verify_length_and_checksum(buf)?;
        let idx = check_directive(
            buf,
            header_len,
            full_len_without_crc,
            FileDirectiveType::PromptPdu,
            1,
        )?;
        let response_required = if buf[idx] >> 7 == 0 {
            PromptResponse::Nak
        } else {
            PromptResponse::KeepAlive
        };
        Ok(Self {
            pdu_header,
            response_required,
        })
    }
}

impl CfdpPdu for PromptPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::PromptPdu)
    }
}

impl WritablePduPacket for PromptPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        ensure_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::PromptPdu as u8;
        buf[current_idx + 1] = (self.response_required as u8) << 7;
        current_idx += 2;
        Ok(add_crc_if_enabled(self.crc_flag(), buf, current_idx))
    }
}
