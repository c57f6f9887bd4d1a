//! # Management Information Base (MIB)
//!
//! The [Mib] stores the local entity record and one [RemoteEntityConfig] per remote entity, as
//! specified in chapter 8 of the CFDP standard. It is an explicit configuration object owned by
//! the [crate::kernel::Kernel] and lent to every machine step.
//!
//! Lookups of remote entity parameters never fail: the first lookup for an entity ID which was
//! not configured creates a record with the default values (see
//! [RemoteEntityConfig::new_with_default_values]).
//!
//! Parameters can also be set by name with [Mib::set_local] and [Mib::set_remote]. Unknown
//! parameter names are rejected with [MibError::UnknownParameter]. The whole MIB can be
//! persisted as a JSON document with [Mib::dump] and [Mib::load].
use core::{str::FromStr, time::Duration};
use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use spacepackets::{
    cfdp::{ChecksumType, TransmissionMode},
    util::{UnsignedByteField, UnsignedEnum},
};

pub const DEFAULT_ACK_LIMIT: u32 = 3;
pub const DEFAULT_ACK_TIMEOUT_SECONDS: f32 = 10.0;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECONDS: f32 = 30.0;
pub const DEFAULT_NAK_TIMEOUT_SECONDS: f32 = 10.0;
pub const DEFAULT_NAK_LIMIT: u32 = 3;
pub const DEFAULT_MAX_FILE_SEGMENT_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MibError {
    #[error("unknown MIB parameter {0:?}")]
    UnknownParameter(String),
    #[error("invalid value for MIB parameter {parameter:?}: {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: &'static str,
    },
    #[error("MIB serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controls which optional indications are passed to the [crate::user::CfdpUser].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntityRecord {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
}

/// This structure models the remote entity configuration information as specified in chapter 8.3
/// of the CFDP standard.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity.
/// * `ut_address` - Optional address of the remote entity inside the underlying transport.
/// * `max_file_segment_len` - Maximum length of the file data inside one File Data PDU.
///    Defaults to 128.
/// * `default_transmission_mode` - Used if the Put request does not specify a transmission
///    mode. Defaults to unacknowledged.
/// * `default_crc_type` - Checksum type used for all file transmissions to this remote entity.
///    Defaults to CRC32.
/// * `crc_on_transmission_by_default` - Whether PDUs towards this entity carry a CRC.
/// * `closure_requested_by_default` - Used if the Put request does not specify the closure
///    requested flag.
/// * `disposition_on_cancellation` - Determines whether an incomplete received file is discarded
///    on transaction cancellation. Defaults to false.
/// * `ack_limit`, `ack_timer_interval_seconds` - Positive acknowledgement procedure parameters,
///    defaults 3 and 10 seconds.
/// * `nak_limit`, `nak_timer_interval_seconds` - Deferred lost segment procedure parameters,
///    defaults 3 and 10 seconds.
/// * `inactivity_timeout_seconds` - Expiry period of the inactivity timer of receiving
///    transactions. Defaults to 30 seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub ut_address: Option<String>,
    pub max_file_segment_len: usize,
    pub default_transmission_mode: TransmissionMode,
    pub default_crc_type: ChecksumType,
    pub crc_on_transmission_by_default: bool,
    pub closure_requested_by_default: bool,
    pub disposition_on_cancellation: bool,
    pub ack_limit: u32,
    pub ack_timer_interval_seconds: f32,
    pub nak_limit: u32,
    pub nak_timer_interval_seconds: f32,
    pub inactivity_timeout_seconds: f32,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(entity_id: UnsignedByteField) -> Self {
        Self {
            entity_id,
            ut_address: None,
            max_file_segment_len: DEFAULT_MAX_FILE_SEGMENT_LEN,
            default_transmission_mode: TransmissionMode::Unacknowledged,
            default_crc_type: ChecksumType::Crc32,
            crc_on_transmission_by_default: false,
            closure_requested_by_default: false,
            disposition_on_cancellation: false,
            ack_limit: DEFAULT_ACK_LIMIT,
            ack_timer_interval_seconds: DEFAULT_ACK_TIMEOUT_SECONDS,
            nak_limit: DEFAULT_NAK_LIMIT,
            nak_timer_interval_seconds: DEFAULT_NAK_TIMEOUT_SECONDS,
            inactivity_timeout_seconds: DEFAULT_INACTIVITY_TIMEOUT_SECONDS,
        }
    }
}

/// Typed value for the by-name setters.
#[derive(Debug, Clone, PartialEq)]
pub enum MibValue {
    Bool(bool),
    Int(u64),
    Seconds(f32),
    Text(String),
    EntityId(UnsignedByteField),
    TransmissionMode(TransmissionMode),
    ChecksumType(ChecksumType),
}

/// Names accepted by [Mib::set_local].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LocalParameter {
    LocalEntityId,
    EofSentIndication,
    EofRecvIndication,
    FileSegmentRecvIndication,
    TransactionFinishedIndication,
    SuspendedIndication,
    ResumedIndication,
}

impl FromStr for LocalParameter {
    type Err = MibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "local_entity_id" => LocalParameter::LocalEntityId,
            "eof_sent_indication" => LocalParameter::EofSentIndication,
            "eof_recv_indication" => LocalParameter::EofRecvIndication,
            "file_segment_recv_indication" => LocalParameter::FileSegmentRecvIndication,
            "transaction_finished_indication" => LocalParameter::TransactionFinishedIndication,
            "suspended_indication" => LocalParameter::SuspendedIndication,
            "resumed_indication" => LocalParameter::ResumedIndication,
            _ => return Err(MibError::UnknownParameter(s.to_string())),
        })
    }
}

/// Names accepted by [Mib::set_remote].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemoteParameter {
    UtAddress,
    MaxFileSegmentLength,
    DefaultTransmissionMode,
    DefaultChecksumType,
    CrcOnTransmission,
    ClosureRequested,
    DispositionOnCancellation,
    AckLimit,
    AckTimeout,
    NakLimit,
    NakTimeout,
    InactivityTimeout,
}

impl FromStr for RemoteParameter {
    type Err = MibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ut_address" => RemoteParameter::UtAddress,
            "max_file_segment_length" => RemoteParameter::MaxFileSegmentLength,
            "default_transmission_mode" => RemoteParameter::DefaultTransmissionMode,
            "default_checksum_type" => RemoteParameter::DefaultChecksumType,
            "crc_on_transmission" => RemoteParameter::CrcOnTransmission,
            "closure_requested" => RemoteParameter::ClosureRequested,
            "disposition_on_cancellation" => RemoteParameter::DispositionOnCancellation,
            "ack_limit" => RemoteParameter::AckLimit,
            "ack_timeout" => RemoteParameter::AckTimeout,
            "nak_limit" => RemoteParameter::NakLimit,
            "nak_timeout" => RemoteParameter::NakTimeout,
            "inactivity_timeout" => RemoteParameter::InactivityTimeout,
            _ => return Err(MibError::UnknownParameter(s.to_string())),
        })
    }
}

fn expect_bool(parameter: &'static str, value: MibValue) -> Result<bool, MibError> {
    match value {
        MibValue::Bool(value) => Ok(value),
        _ => Err(MibError::InvalidValue {
            parameter,
            reason: "expected a boolean",
        }),
    }
}

fn expect_u32(parameter: &'static str, value: MibValue) -> Result<u32, MibError> {
    match value {
        MibValue::Int(value) => u32::try_from(value).map_err(|_| MibError::InvalidValue {
            parameter,
            reason: "value exceeds 32 bits",
        }),
        _ => Err(MibError::InvalidValue {
            parameter,
            reason: "expected an integer",
        }),
    }
}

fn expect_seconds(parameter: &'static str, value: MibValue) -> Result<f32, MibError> {
    let seconds = match value {
        MibValue::Seconds(seconds) => seconds,
        MibValue::Int(seconds) => seconds as f32,
        _ => {
            return Err(MibError::InvalidValue {
                parameter,
                reason: "expected seconds",
            })
        }
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(MibError::InvalidValue {
            parameter,
            reason: "seconds must be finite and not negative",
        });
    }
    Ok(seconds)
}

fn seconds_to_duration(seconds: f32) -> Duration {
    Duration::try_from_secs_f32(seconds).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mib {
    local: LocalEntityRecord,
    remotes: HashMap<u64, RemoteEntityConfig>,
}

impl Mib {
    pub fn new(local_entity_id: impl Into<UnsignedByteField>) -> Self {
        Self::new_with_indication_cfg(local_entity_id, IndicationConfig::default())
    }

    pub fn new_with_indication_cfg(
        local_entity_id: impl Into<UnsignedByteField>,
        indication_cfg: IndicationConfig,
    ) -> Self {
        Self {
            local: LocalEntityRecord {
                id: local_entity_id.into(),
                indication_cfg,
            },
            remotes: HashMap::new(),
        }
    }

    pub fn local_entity_id(&self) -> UnsignedByteField {
        self.local.id
    }

    pub fn set_local_entity_id(&mut self, id: impl Into<UnsignedByteField>) {
        self.local.id = id.into();
    }

    pub fn indication_cfg(&self) -> &IndicationConfig {
        &self.local.indication_cfg
    }

    pub fn indication_cfg_mut(&mut self) -> &mut IndicationConfig {
        &mut self.local.indication_cfg
    }

    /// Adds or replaces a remote entity configuration. Returns the replaced configuration.
    pub fn add_remote_config(&mut self, cfg: RemoteEntityConfig) -> Option<RemoteEntityConfig> {
        self.remotes.insert(cfg.entity_id.value(), cfg)
    }

    pub fn remove_remote_config(&mut self, remote_id: u64) -> Option<RemoteEntityConfig> {
        self.remotes.remove(&remote_id)
    }

    /// Lookup without creating a default record.
    pub fn get_remote_config(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.remotes.get(&remote_id)
    }

    pub fn num_remote_configs(&self) -> usize {
        self.remotes.len()
    }

    /// Returns the remote configuration, creating a default record for unseen IDs.
    pub fn remote_config(&mut self, remote_id: UnsignedByteField) -> &RemoteEntityConfig {
        self.remote_config_mut(remote_id)
    }

    pub fn remote_config_mut(&mut self, remote_id: UnsignedByteField) -> &mut RemoteEntityConfig {
        self.remotes
            .entry(remote_id.value())
            .or_insert_with(|| {
                log::debug!(
                    "creating default remote entity configuration for ID {}",
                    remote_id.value()
                );
                RemoteEntityConfig::new_with_default_values(remote_id)
            })
    }

    pub fn ack_limit(&mut self, remote_id: UnsignedByteField) -> u32 {
        self.remote_config(remote_id).ack_limit
    }

    pub fn ack_timeout(&mut self, remote_id: UnsignedByteField) -> Duration {
        seconds_to_duration(self.remote_config(remote_id).ack_timer_interval_seconds)
    }

    pub fn inactivity_timeout(&mut self, remote_id: UnsignedByteField) -> Duration {
        seconds_to_duration(self.remote_config(remote_id).inactivity_timeout_seconds)
    }

    pub fn nak_timeout(&mut self, remote_id: UnsignedByteField) -> Duration {
        seconds_to_duration(self.remote_config(remote_id).nak_timer_interval_seconds)
    }

    pub fn nak_limit(&mut self, remote_id: UnsignedByteField) -> u32 {
        self.remote_config(remote_id).nak_limit
    }

    pub fn max_file_segment_length(&mut self, remote_id: UnsignedByteField) -> usize {
        self.remote_config(remote_id).max_file_segment_len
    }

    pub fn ut_address(&mut self, remote_id: UnsignedByteField) -> Option<String> {
        self.remote_config(remote_id).ut_address.clone()
    }

    pub fn set_local(&mut self, parameter: &str, value: MibValue) -> Result<(), MibError> {
        let parameter = LocalParameter::from_str(parameter)?;
        let indication_cfg = &mut self.local.indication_cfg;
        match parameter {
            LocalParameter::LocalEntityId => {
                self.local.id = match value {
                    MibValue::EntityId(id) => id,
                    MibValue::Int(raw) => {
                        let width = self.local.id.size();
                        if width < 8 && raw >> (8 * width) != 0 {
                            return Err(MibError::InvalidValue {
                                parameter: "local_entity_id",
                                reason: "value does not fit the entity ID width",
                            });
                        }
                        UnsignedByteField::new(width, raw)
                    }
                    _ => {
                        return Err(MibError::InvalidValue {
                            parameter: "local_entity_id",
                            reason: "expected an entity ID",
                        })
                    }
                }
            }
            LocalParameter::EofSentIndication => {
                indication_cfg.eof_sent = expect_bool("eof_sent_indication", value)?
            }
            LocalParameter::EofRecvIndication => {
                indication_cfg.eof_recv = expect_bool("eof_recv_indication", value)?
            }
            LocalParameter::FileSegmentRecvIndication => {
                indication_cfg.file_segment_recv =
                    expect_bool("file_segment_recv_indication", value)?
            }
            LocalParameter::TransactionFinishedIndication => {
                indication_cfg.transaction_finished =
                    expect_bool("transaction_finished_indication", value)?
            }
            LocalParameter::SuspendedIndication => {
                indication_cfg.suspended = expect_bool("suspended_indication", value)?
            }
            LocalParameter::ResumedIndication => {
                indication_cfg.resumed = expect_bool("resumed_indication", value)?
            }
        }
        Ok(())
    }

    pub fn set_remote(
        &mut self,
        remote_id: UnsignedByteField,
        parameter: &str,
        value: MibValue,
    ) -> Result<(), MibError> {
        let parameter = RemoteParameter::from_str(parameter)?;
        let cfg = self.remote_config_mut(remote_id);
        match parameter {
            RemoteParameter::UtAddress => match value {
                MibValue::Text(address) => cfg.ut_address = Some(address),
                _ => {
                    return Err(MibError::InvalidValue {
                        parameter: "ut_address",
                        reason: "expected text",
                    })
                }
            },
            RemoteParameter::MaxFileSegmentLength => {
                let len = expect_u32("max_file_segment_length", value)?;
                if len == 0 {
                    return Err(MibError::InvalidValue {
                        parameter: "max_file_segment_length",
                        reason: "segment length must be positive",
                    });
                }
                cfg.max_file_segment_len = len as usize;
            }
            RemoteParameter::DefaultTransmissionMode => match value {
                MibValue::TransmissionMode(mode) => cfg.default_transmission_mode = mode,
                _ => {
                    return Err(MibError::InvalidValue {
                        parameter: "default_transmission_mode",
                        reason: "expected a transmission mode",
                    })
                }
            },
            RemoteParameter::DefaultChecksumType => match value {
                MibValue::ChecksumType(checksum_type) => cfg.default_crc_type = checksum_type,
                _ => {
                    return Err(MibError::InvalidValue {
                        parameter: "default_checksum_type",
                        reason: "expected a checksum type",
                    })
                }
            },
            RemoteParameter::CrcOnTransmission => {
                cfg.crc_on_transmission_by_default = expect_bool("crc_on_transmission", value)?
            }
            RemoteParameter::ClosureRequested => {
                cfg.closure_requested_by_default = expect_bool("closure_requested", value)?
            }
            RemoteParameter::DispositionOnCancellation => {
                cfg.disposition_on_cancellation =
                    expect_bool("disposition_on_cancellation", value)?
            }
            RemoteParameter::AckLimit => cfg.ack_limit = expect_u32("ack_limit", value)?,
            RemoteParameter::AckTimeout => {
                cfg.ack_timer_interval_seconds = expect_seconds("ack_timeout", value)?
            }
            RemoteParameter::NakLimit => cfg.nak_limit = expect_u32("nak_limit", value)?,
            RemoteParameter::NakTimeout => {
                cfg.nak_timer_interval_seconds = expect_seconds("nak_timeout", value)?
            }
            RemoteParameter::InactivityTimeout => {
                cfg.inactivity_timeout_seconds = expect_seconds("inactivity_timeout", value)?
            }
        }
        Ok(())
    }

    /// Serializes the local record and all remote records as a JSON document.
    pub fn dump(&self) -> Result<String, MibError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(document: &str) -> Result<Self, MibError> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<(), MibError> {
        std::fs::write(path, self.dump()?)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, MibError> {
        Self::load(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::util::{UnsignedByteFieldU16, UnsignedByteFieldU8};
    use tempfile::tempdir;

    use super::*;

    fn remote(id: u16) -> UnsignedByteField {
        UnsignedByteFieldU16::new(id).into()
    }

    #[test]
    fn test_defaults_for_unseen_entity() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        assert_eq!(mib.num_remote_configs(), 0);
        assert_eq!(mib.ack_limit(remote(7)), 3);
        assert_eq!(mib.num_remote_configs(), 1);
        assert_eq!(mib.ack_timeout(remote(7)), Duration::from_secs(10));
        assert_eq!(mib.inactivity_timeout(remote(7)), Duration::from_secs(30));
        assert_eq!(mib.nak_timeout(remote(7)), Duration::from_secs(10));
        assert_eq!(mib.nak_limit(remote(7)), 3);
        assert_eq!(mib.max_file_segment_length(remote(7)), 128);
        assert_eq!(mib.ut_address(remote(7)), None);
        assert_eq!(mib.num_remote_configs(), 1);
        assert!(mib.get_remote_config(8).is_none());
        assert_eq!(mib.max_file_segment_length(remote(8)), 128);
        assert_eq!(mib.num_remote_configs(), 2);
    }

    #[test]
    fn test_set_remote_by_name() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        mib.set_remote(remote(2), "max_file_segment_length", MibValue::Int(512))
            .unwrap();
        mib.set_remote(remote(2), "inactivity_timeout", MibValue::Seconds(0.5))
            .unwrap();
        mib.set_remote(remote(2), "ut_address", MibValue::Text("127.0.0.1:5111".into()))
            .unwrap();
        assert_eq!(mib.max_file_segment_length(remote(2)), 512);
        assert_eq!(mib.inactivity_timeout(remote(2)), Duration::from_millis(500));
        assert_eq!(mib.ut_address(remote(2)).as_deref(), Some("127.0.0.1:5111"));
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        let before = mib.clone();
        let result = mib.set_local("does_not_exist", MibValue::Bool(true));
        assert!(matches!(
            result,
            Err(MibError::UnknownParameter(name)) if name == "does_not_exist"
        ));
        assert!(matches!(
            mib.set_remote(remote(2), "retransmit_everything", MibValue::Bool(true)),
            Err(MibError::UnknownParameter(_))
        ));
        assert_eq!(mib.local_entity_id(), before.local_entity_id());
        assert_eq!(mib.indication_cfg(), before.indication_cfg());
    }

    #[test]
    fn test_invalid_values() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        assert!(matches!(
            mib.set_remote(remote(2), "nak_timeout", MibValue::Seconds(-1.0)),
            Err(MibError::InvalidValue { .. })
        ));
        assert!(matches!(
            mib.set_remote(remote(2), "ack_limit", MibValue::Bool(true)),
            Err(MibError::InvalidValue { .. })
        ));
        assert!(matches!(
            mib.set_local("local_entity_id", MibValue::Int(0x1_0000)),
            Err(MibError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_set_local() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        mib.set_local("local_entity_id", MibValue::Int(5)).unwrap();
        assert_eq!(mib.local_entity_id(), UnsignedByteFieldU16::new(5).into());
        mib.set_local(
            "local_entity_id",
            MibValue::EntityId(UnsignedByteFieldU8::new(9).into()),
        )
        .unwrap();
        assert_eq!(mib.local_entity_id().size(), 1);
        mib.set_local("eof_sent_indication", MibValue::Bool(false))
            .unwrap();
        assert!(!mib.indication_cfg().eof_sent);
    }

    #[test]
    fn test_dump_and_load() {
        let mut mib = Mib::new(UnsignedByteFieldU16::new(1));
        mib.set_remote(remote(2), "ack_limit", MibValue::Int(5)).unwrap();
        mib.set_remote(
            remote(3),
            "default_checksum_type",
            MibValue::ChecksumType(ChecksumType::Modular),
        )
        .unwrap();
        let document = mib.dump().unwrap();
        let loaded = Mib::load(&document).unwrap();
        assert_eq!(loaded, mib);

        let tmpdir = tempdir().expect("creating tmpdir failed");
        let path = tmpdir.path().join("mib.json");
        mib.dump_to_file(&path).unwrap();
        let mut loaded = Mib::load_from_file(&path).unwrap();
        assert_eq!(loaded.ack_limit(remote(2)), 5);
        assert_eq!(
            loaded.remote_config(remote(3)).default_crc_type,
            ChecksumType::Modular
        );
    }

    #[test]
    fn test_load_garbage() {
        assert!(matches!(
            Mib::load("{ not json"),
            Err(MibError::Serialization(_))
        ));
    }
}
