//! File checksums as selected by the checksum type field of the Metadata PDU.
//!
//! The sending machine accumulates the checksum while reading the file, the receiving machine
//! verifies it over the written file through the [crate::filestore::VirtualFilestore].
use core::fmt::Debug;

use crc::{Crc, Digest, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use spacepackets::cfdp::ChecksumType;

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub static CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub static CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CFDP modular checksum. The file is treated as a sequence of big endian 32 bit words aligned
/// to the start of the file, and the checksum is the wrapping sum of all words. Because every
/// byte is weighted by its absolute offset, segments may be added in any order.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModularChecksum {
    sum: u32,
}

impl ModularChecksum {
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        for (idx, byte) in data.iter().enumerate() {
            let shift = 8 * (3 - ((offset + idx as u64) % 4) as u32);
            self.sum = self.sum.wrapping_add((*byte as u32) << shift);
        }
    }

    pub fn value(&self) -> u32 {
        self.sum
    }
}

/// Incremental checksum for one of the supported [ChecksumType]s.
///
/// The CRC variants require the data to be passed in file order.
pub enum FileChecksum {
    Modular(ModularChecksum),
    Crc32(Digest<'static, u32>),
    Crc32C(Digest<'static, u32>),
    Null,
}

impl FileChecksum {
    /// Returns [None] for checksum types which are not supported.
    pub fn new(checksum_type: ChecksumType) -> Option<Self> {
        Some(match checksum_type {
            ChecksumType::Modular => FileChecksum::Modular(ModularChecksum::default()),
            ChecksumType::Crc32 => FileChecksum::Crc32(CRC_32.digest()),
            ChecksumType::Crc32C => FileChecksum::Crc32C(CRC_32C.digest()),
            ChecksumType::NullChecksum => FileChecksum::Null,
            _ => return None,
        })
    }

    pub fn is_supported(checksum_type: ChecksumType) -> bool {
        matches!(
            checksum_type,
            ChecksumType::Modular
                | ChecksumType::Crc32
                | ChecksumType::Crc32C
                | ChecksumType::NullChecksum
        )
    }

    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            FileChecksum::Modular(_) => ChecksumType::Modular,
            FileChecksum::Crc32(_) => ChecksumType::Crc32,
            FileChecksum::Crc32C(_) => ChecksumType::Crc32C,
            FileChecksum::Null => ChecksumType::NullChecksum,
        }
    }

    pub fn update(&mut self, offset: u64, data: &[u8]) {
        match self {
            FileChecksum::Modular(modular) => modular.update(offset, data),
            FileChecksum::Crc32(digest) | FileChecksum::Crc32C(digest) => digest.update(data),
            FileChecksum::Null => (),
        }
    }

    pub fn finalize(self) -> u32 {
        match self {
            FileChecksum::Modular(modular) => modular.value(),
            FileChecksum::Crc32(digest) | FileChecksum::Crc32C(digest) => digest.finalize(),
            FileChecksum::Null => 0,
        }
    }
}

impl Debug for FileChecksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FileChecksum")
            .field(&self.checksum_type())
            .finish()
    }
}
