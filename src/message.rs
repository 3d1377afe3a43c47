//! Application-layer message parsing: function codes and payload decoding.
//!
//! Frames are dispatched on their 16-bit function code. Response codes
//! follow the protocol's convention of setting bit 7 of the command code
//! (0x0302 grant / 0x0382 grant-ack, 0x003f time request / 0x00bf reply).

use deku::prelude::*;
use log::{debug, info};
use thiserror::Error;

use crate::frame::{Frame, dump_data};
use crate::records::{RecordError, Snapshot, parse_device_data};

pub const ENCRYPTED_ENVELOPE: u16 = 0x003d;
pub const SERVER_GET_GMT: u16 = 0x003f;
pub const RESP_ACK: u16 = 0x0080;
pub const RESP_NACK: u16 = 0x0081;
pub const RESP_MISC: u16 = 0x0082;
pub const RESP_SERVER_GMT: u16 = 0x00bf;
/// Shared by ParamsGetSingle and UpgradeStart.
pub const PARAMS_GET_SINGLE: u16 = 0x0200;
pub const PARAMS_SET_SINGLE: u16 = 0x0201;
pub const UPGRADE_WRITE: u16 = 0x0203;
pub const RESP_PARAMS_SINGLE: u16 = 0x0280;
pub const POLESTAR_MASTER_GRANT: u16 = 0x0302;
pub const POLESTAR_MASTER_GRANT_ACK: u16 = 0x0382;
/// Observed on RS485 buses; meaning unknown, logged and ignored.
pub const POLESTAR_UNKNOWN_039A: u16 = 0x039a;
pub const RESP_POLESTAR_GET_STATUS: u16 = 0x039f;
pub const SERVER_POST_DATA: u16 = 0x0500;
pub const KEY_EXCHANGE: u16 = 0x0503;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageError {
    #[error("failed to decode payload for function {function:#06x}: {source}")]
    PayloadError {
        function: u16,
        source: DekuError,
    },
    #[error("upgrade write payload too short ({0} bytes)")]
    UpgradeWriteTooShort(usize),
    #[error(transparent)]
    RecordError(#[from] RecordError),
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ParamPayload {
    pub param: u16,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ParamValuePayload {
    pub param: u16,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ValueTypePayload {
    pub value: u32,
    pub data_type: u16,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct TimePayload {
    pub time: u32,
    pub tz_offset: i32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct UpgradeWriteHeader {
    pub offset: u32,
    pub length: u32,
}

/// A frame's payload decoded according to its function code.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PostData(Snapshot),
    KeyExchange(Vec<u8>),
    /// Ciphertext of a wrapped frame; the session layer deciphers it and
    /// classifies the inner frame.
    Encrypted(Vec<u8>),
    GetGmt,
    GmtResponse(TimePayload),
    Ack,
    Nack(Vec<u8>),
    Misc(Vec<u8>),
    ParamRequest(ParamPayload),
    ParamSet(ParamValuePayload),
    ParamResponse(ValueTypePayload),
    UpgradeWrite {
        offset: u32,
        length: u32,
        data: Vec<u8>,
    },
    MasterGrant,
    MasterGrantAck,
    StatusResponse(Vec<u8>),
    Ignored {
        function: u16,
    },
    Unknown {
        function: u16,
        data: Vec<u8>,
    },
}

fn decode<T>(function: u16, data: &[u8]) -> Result<T, MessageError>
where
    T: for<'a> DekuContainerRead<'a>,
{
    let ((rest, _), payload) =
        T::from_bytes((data, 0)).map_err(|source| MessageError::PayloadError { function, source })?;
    if !rest.is_empty() {
        debug!(
            "{} leftover bytes in payload for function {function:#06x}",
            rest.len()
        );
    }
    Ok(payload)
}

pub fn parse_message(frame: &Frame) -> Result<Message, MessageError> {
    let function = frame.function;
    let data = &frame.data;
    match function {
        SERVER_POST_DATA => Ok(Message::PostData(parse_device_data(data)?)),
        KEY_EXCHANGE => Ok(Message::KeyExchange(data.clone())),
        ENCRYPTED_ENVELOPE => Ok(Message::Encrypted(data.clone())),
        SERVER_GET_GMT => Ok(Message::GetGmt),
        RESP_SERVER_GMT => {
            let payload: TimePayload = decode(function, data)?;
            debug!(
                "time: {} tz: {:+}s",
                crate::records::format_date_time(payload.time),
                payload.tz_offset
            );
            Ok(Message::GmtResponse(payload))
        }
        RESP_ACK => Ok(Message::Ack),
        RESP_NACK => {
            info!("nack: {}", hex::encode(data));
            Ok(Message::Nack(data.clone()))
        }
        RESP_MISC => {
            info!("misc response: {}", hex::encode(data));
            Ok(Message::Misc(data.clone()))
        }
        PARAMS_GET_SINGLE => Ok(Message::ParamRequest(decode(function, data)?)),
        PARAMS_SET_SINGLE => Ok(Message::ParamSet(decode(function, data)?)),
        RESP_PARAMS_SINGLE => Ok(Message::ParamResponse(decode(function, data)?)),
        UPGRADE_WRITE => {
            if data.len() < 8 {
                return Err(MessageError::UpgradeWriteTooShort(data.len()));
            }
            let header: UpgradeWriteHeader = decode(function, &data[..8])?;
            Ok(Message::UpgradeWrite {
                offset: header.offset,
                length: header.length,
                data: data[8..].to_vec(),
            })
        }
        POLESTAR_MASTER_GRANT => Ok(Message::MasterGrant),
        POLESTAR_MASTER_GRANT_ACK => Ok(Message::MasterGrantAck),
        RESP_POLESTAR_GET_STATUS => {
            dump_data(data);
            Ok(Message::StatusResponse(data.clone()))
        }
        POLESTAR_UNKNOWN_039A => {
            info!("ignoring function 0x039a: {}", hex::encode(data));
            Ok(Message::Ignored { function })
        }
        function => {
            info!("unknown function {function:#06x}");
            dump_data(data);
            Ok(Message::Unknown {
                function,
                data: data.clone(),
            })
        }
    }
}
