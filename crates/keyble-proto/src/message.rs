//! Message type registry and byte-level codec.
//!
//! The protocol defines a closed set of 14 message types, identified by a
//! one-byte id. Types with the high bit set are "secure": their payload is
//! encrypted and authenticated by the session layer before fragmentation.
//! The registry is the [`MessageKind`] enum; a decoded instance is a
//! [`Message`] variant carrying the structured fields of its type.
//!
//! Field layouts are fixed byte offsets and bit masks, reproduced exactly as
//! the lock firmware expects them. Payloads may carry trailing zero bytes
//! from fragment padding; decoders only read the fixed prefix they need and
//! reject payloads shorter than that prefix.

use crate::bytes::{be16, is_bit_set, pad_end};
use crate::error::ProtocolError;

/// Size of the zero-padded user name field in `USER_NAME_SET`.
pub const USER_NAME_LEN: usize = 20;

/// Size of the padded encrypted pairing key field in `PAIRING_REQUEST`.
pub const PAIR_KEY_FIELD_LEN: usize = 22;

/// The closed registry of message types, looked up by numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Acknowledges one fragment of a multi-fragment message.
    FragmentAck,
    /// Generic negative/positive answer outside a secure session.
    AnswerWithoutSecurity,
    /// Starts the session nonce exchange.
    ConnectionRequest,
    /// Lock's reply to `CONNECTION_REQUEST`; carries the remote nonce.
    ConnectionInfo,
    /// Registers a new user key, encrypted with the key-card key.
    PairingRequest,
    /// Unsolicited hint from the lock that its status changed.
    StatusChangedNotification,
    /// Asks the lock to drop the connection.
    CloseConnection,
    /// Generic answer inside a secure session.
    AnswerWithSecurity,
    /// Sets the lock's clock and requests a `STATUS_INFO` reply.
    StatusRequest,
    /// Lock state, battery and pairing flags.
    StatusInfo,
    /// Configures mounting parameters of the lock.
    MountOptionsSet,
    /// Lock / unlock / open command.
    Command,
    /// Reply to `USER_NAME_SET`.
    UserInfo,
    /// Renames a user slot.
    UserNameSet,
}

impl MessageKind {
    /// All known message types, in id order.
    pub const ALL: [Self; 14] = [
        Self::FragmentAck,
        Self::AnswerWithoutSecurity,
        Self::ConnectionRequest,
        Self::ConnectionInfo,
        Self::PairingRequest,
        Self::StatusChangedNotification,
        Self::CloseConnection,
        Self::AnswerWithSecurity,
        Self::StatusRequest,
        Self::StatusInfo,
        Self::MountOptionsSet,
        Self::Command,
        Self::UserInfo,
        Self::UserNameSet,
    ];

    /// Wire id of this message type.
    pub fn id(self) -> u8 {
        match self {
            Self::FragmentAck => 0x00,
            Self::AnswerWithoutSecurity => 0x01,
            Self::ConnectionRequest => 0x02,
            Self::ConnectionInfo => 0x03,
            Self::PairingRequest => 0x04,
            Self::StatusChangedNotification => 0x05,
            Self::CloseConnection => 0x06,
            Self::AnswerWithSecurity => 0x81,
            Self::StatusRequest => 0x82,
            Self::StatusInfo => 0x83,
            Self::MountOptionsSet => 0x86,
            Self::Command => 0x87,
            Self::UserInfo => 0x8F,
            Self::UserNameSet => 0x90,
        }
    }

    /// Look a message type up by its wire id.
    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.id() == id)
            .ok_or(ProtocolError::UnknownMessageType(id))
    }

    /// Human-readable label, as used in event names and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::FragmentAck => "FRAGMENT_ACK",
            Self::AnswerWithoutSecurity => "ANSWER_WITHOUT_SECURITY",
            Self::ConnectionRequest => "CONNECTION_REQUEST",
            Self::ConnectionInfo => "CONNECTION_INFO",
            Self::PairingRequest => "PAIRING_REQUEST",
            Self::StatusChangedNotification => "STATUS_CHANGED_NOTIFICATION",
            Self::CloseConnection => "CLOSE_CONNECTION",
            Self::AnswerWithSecurity => "ANSWER_WITH_SECURITY",
            Self::StatusRequest => "STATUS_REQUEST",
            Self::StatusInfo => "STATUS_INFO",
            Self::MountOptionsSet => "MOUNT_OPTIONS_SET",
            Self::Command => "COMMAND",
            Self::UserInfo => "USER_INFO",
            Self::UserNameSet => "USER_NAME_SET",
        }
    }

    /// Whether messages of this type are encrypted and authenticated.
    ///
    /// Derived from the wire id: the high bit marks secure types.
    pub fn is_secure(self) -> bool {
        self.id() & 0x80 != 0
    }
}

/// Lock state codes carried in `STATUS_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// State not yet reported, or an unrecognized code.
    Unknown,
    /// Motor running.
    Moving,
    /// Bolt retracted.
    Unlocked,
    /// Bolt extended.
    Locked,
    /// Latch pulled (door can be pushed open).
    Opened,
}

impl LockStatus {
    /// Decode a 3-bit status code. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Moving,
            2 => Self::Unlocked,
            3 => Self::Locked,
            4 => Self::Opened,
            _ => Self::Unknown,
        }
    }

    /// Wire code of this status.
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Moving => 1,
            Self::Unlocked => 2,
            Self::Locked => 3,
            Self::Opened => 4,
        }
    }

    /// Label as used in `status:<NAME>` event names.
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Moving => "MOVING",
            Self::Unlocked => "UNLOCKED",
            Self::Locked => "LOCKED",
            Self::Opened => "OPENED",
        }
    }
}

/// Command codes for the `COMMAND` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    /// Extend the bolt.
    Lock,
    /// Retract the bolt.
    Unlock,
    /// Retract the bolt and pull the latch.
    Open,
}

impl CommandId {
    /// Wire code of this command.
    pub fn code(self) -> u8 {
        match self {
            Self::Lock => 0,
            Self::Unlock => 1,
            Self::Open => 2,
        }
    }

    /// Decode a command code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Lock),
            1 => Some(Self::Unlock),
            2 => Some(Self::Open),
            _ => None,
        }
    }
}

/// Flags carried by the two `ANSWER_*` message types.
///
/// The exact semantics of the low bit are only partially known; `ok` is
/// reliable (high bit clear means the request was not rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    /// High bit of the answer byte is clear.
    pub ok: bool,
    /// Answer byte is exactly `0x01` under the `0x81` mask.
    pub accepted: bool,
}

impl Answer {
    fn decode(byte: u8) -> Self {
        Self { ok: byte & 0x80 == 0, accepted: byte & 0x81 == 0x01 }
    }

    fn code(self) -> u8 {
        if !self.ok {
            0x80
        } else if self.accepted {
            0x01
        } else {
            0x00
        }
    }
}

/// Calendar time as the six bytes of a `STATUS_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    /// Years since 2000.
    pub year: u8,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
    /// Hour, 0-23.
    pub hour: u8,
    /// Minute, 0-59.
    pub minute: u8,
    /// Second, 0-59.
    pub second: u8,
}

/// Decoded fields of a `STATUS_INFO` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    /// Access level of the connected user, bits 4-5 of byte 0.
    pub user_right_type: u8,
    /// Battery warning flag, bit 7 of byte 1.
    pub battery_low: bool,
    /// Whether the lock currently accepts pairing, bit 0 of byte 1.
    pub pairing_allowed: bool,
    /// Lock state, low 3 bits of byte 2.
    pub lock_status: LockStatus,
}

/// Mounting parameters carried by `MOUNT_OPTIONS_SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Whether the lock turns left to lock.
    pub turn_direction_is_left: bool,
    /// Whether the key's neutral position is horizontal.
    pub neutral_position_is_horizontal: bool,
    /// Number of turns required to fully lock, 0-7.
    pub lock_turns: u8,
}

/// A decoded protocol message.
///
/// Immutable once constructed. Outbound messages are built from structured
/// fields and encoded with [`Message::encode`]; inbound messages are decoded
/// from reassembled (and, for secure types, decrypted) payload bytes with
/// [`Message::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Acknowledges the fragment whose status byte is `fragment_id`.
    FragmentAck {
        /// Echoed status byte of the acknowledged fragment.
        fragment_id: u8,
    },
    /// Plain answer.
    AnswerWithoutSecurity(Answer),
    /// Opens the nonce exchange with the caller's user id and fresh nonce.
    ConnectionRequest {
        /// User slot this session authenticates as.
        user_id: u8,
        /// Fresh 8-byte session nonce generated by the client.
        session_nonce: [u8; 8],
    },
    /// The lock's half of the nonce exchange.
    ConnectionInfo {
        /// User id assigned by the lock.
        user_id: u8,
        /// The lock's 8-byte session nonce.
        remote_session_nonce: [u8; 8],
        /// Bootloader version reported by the lock.
        bootloader_version: u8,
        /// Application firmware version reported by the lock.
        application_version: u8,
    },
    /// Registers a new user key (see the pairing flow in `keyble-client`).
    PairingRequest {
        /// User slot to pair.
        user_id: u8,
        /// New user key, stream-encrypted with the card key. At most
        /// 22 bytes; zero-padded on encode.
        encrypted_pair_key: Vec<u8>,
        /// Security counter the pairing crypto was computed with.
        security_counter: u16,
        /// Authentication value over the padded plain pairing data.
        authentication_value: [u8; 4],
    },
    /// Unsolicited status-change hint.
    StatusChangedNotification,
    /// Connection teardown request.
    CloseConnection,
    /// Secure answer.
    AnswerWithSecurity(Answer),
    /// Clock set + status request.
    StatusRequest {
        /// Current date and time.
        date: DeviceTime,
    },
    /// Lock status report.
    StatusInfo(StatusInfo),
    /// Mounting parameter update.
    MountOptionsSet(MountOptions),
    /// Lock / unlock / open.
    Command {
        /// The command to perform.
        command: CommandId,
    },
    /// Reply to `USER_NAME_SET`; carries no fields.
    UserInfo,
    /// Renames a user slot.
    UserNameSet {
        /// User slot to rename.
        user_id: u8,
        /// New name; at most 20 bytes UTF-8.
        user_name: String,
    },
}

impl Message {
    /// The registry entry for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::FragmentAck { .. } => MessageKind::FragmentAck,
            Self::AnswerWithoutSecurity(_) => MessageKind::AnswerWithoutSecurity,
            Self::ConnectionRequest { .. } => MessageKind::ConnectionRequest,
            Self::ConnectionInfo { .. } => MessageKind::ConnectionInfo,
            Self::PairingRequest { .. } => MessageKind::PairingRequest,
            Self::StatusChangedNotification => MessageKind::StatusChangedNotification,
            Self::CloseConnection => MessageKind::CloseConnection,
            Self::AnswerWithSecurity(_) => MessageKind::AnswerWithSecurity,
            Self::StatusRequest { .. } => MessageKind::StatusRequest,
            Self::StatusInfo(_) => MessageKind::StatusInfo,
            Self::MountOptionsSet(_) => MessageKind::MountOptionsSet,
            Self::Command { .. } => MessageKind::Command,
            Self::UserInfo => MessageKind::UserInfo,
            Self::UserNameSet { .. } => MessageKind::UserNameSet,
        }
    }

    /// Encode the structured fields to the flat payload byte sequence.
    ///
    /// The payload excludes the type id byte (prepended by the
    /// fragmentation layer) and any security trailer (appended by the
    /// session layer for secure types).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::FragmentAck { fragment_id } => Ok(vec![*fragment_id]),
            Self::AnswerWithoutSecurity(answer) | Self::AnswerWithSecurity(answer) => {
                Ok(vec![answer.code()])
            },
            Self::ConnectionRequest { user_id, session_nonce } => {
                let mut out = Vec::with_capacity(9);
                out.push(*user_id);
                out.extend_from_slice(session_nonce);
                Ok(out)
            },
            Self::ConnectionInfo {
                user_id,
                remote_session_nonce,
                bootloader_version,
                application_version,
            } => {
                let mut out = Vec::with_capacity(12);
                out.push(*user_id);
                out.extend_from_slice(remote_session_nonce);
                out.push(0);
                out.push(*bootloader_version);
                out.push(*application_version);
                Ok(out)
            },
            Self::PairingRequest {
                user_id,
                encrypted_pair_key,
                security_counter,
                authentication_value,
            } => {
                let mut out = Vec::with_capacity(29);
                out.push(*user_id);
                out.extend_from_slice(&pad_end(encrypted_pair_key, PAIR_KEY_FIELD_LEN));
                out.extend_from_slice(&be16(*security_counter));
                out.extend_from_slice(authentication_value);
                Ok(out)
            },
            Self::StatusChangedNotification | Self::CloseConnection | Self::UserInfo => {
                Ok(Vec::new())
            },
            Self::StatusRequest { date } => {
                Ok(vec![date.year, date.month, date.day, date.hour, date.minute, date.second])
            },
            Self::StatusInfo(info) => {
                // Only the client-relevant bits; remaining bytes are zero.
                let byte0 = (info.user_right_type & 0x03) << 4;
                let byte1 =
                    (u8::from(info.battery_low) << 7) | u8::from(info.pairing_allowed);
                Ok(vec![byte0, byte1, info.lock_status.code() & 0x07, 0, 0, 0])
            },
            Self::MountOptionsSet(options) => {
                let byte0 = u8::from(options.turn_direction_is_left)
                    | (u8::from(options.neutral_position_is_horizontal) << 1);
                Ok(vec![byte0, options.lock_turns & 0x07, 0, 0, 0, 0, 0, 0])
            },
            Self::Command { command } => Ok(vec![command.code()]),
            Self::UserNameSet { user_id, user_name } => {
                let name = user_name.as_bytes();
                if name.len() > USER_NAME_LEN {
                    return Err(ProtocolError::NameTooLong { limit: USER_NAME_LEN });
                }
                let mut out = Vec::with_capacity(1 + USER_NAME_LEN);
                out.push(*user_id);
                out.extend_from_slice(&pad_end(name, USER_NAME_LEN));
                Ok(out)
            },
        }
    }

    /// Decode a payload byte sequence as a message of type `kind`.
    ///
    /// `data` is the reassembled payload after decryption (for secure
    /// types), possibly carrying trailing fragment-padding zeros.
    pub fn decode(kind: MessageKind, data: &[u8]) -> Result<Self, ProtocolError> {
        let need = |needed: usize| -> Result<(), ProtocolError> {
            if data.len() < needed {
                Err(ProtocolError::Truncated { label: kind.label(), needed, got: data.len() })
            } else {
                Ok(())
            }
        };

        match kind {
            MessageKind::FragmentAck => {
                need(1)?;
                Ok(Self::FragmentAck { fragment_id: data[0] })
            },
            MessageKind::AnswerWithoutSecurity => {
                need(1)?;
                Ok(Self::AnswerWithoutSecurity(Answer::decode(data[0])))
            },
            MessageKind::ConnectionRequest => {
                need(9)?;
                let mut session_nonce = [0u8; 8];
                session_nonce.copy_from_slice(&data[1..9]);
                Ok(Self::ConnectionRequest { user_id: data[0], session_nonce })
            },
            MessageKind::ConnectionInfo => {
                need(12)?;
                let mut remote_session_nonce = [0u8; 8];
                remote_session_nonce.copy_from_slice(&data[1..9]);
                Ok(Self::ConnectionInfo {
                    user_id: data[0],
                    remote_session_nonce,
                    bootloader_version: data[10],
                    application_version: data[11],
                })
            },
            MessageKind::PairingRequest => {
                need(29)?;
                let mut authentication_value = [0u8; 4];
                authentication_value.copy_from_slice(&data[25..29]);
                let security_counter = u16::from_be_bytes([data[23], data[24]]);
                Ok(Self::PairingRequest {
                    user_id: data[0],
                    encrypted_pair_key: data[1..23].to_vec(),
                    security_counter,
                    authentication_value,
                })
            },
            MessageKind::StatusChangedNotification => Ok(Self::StatusChangedNotification),
            MessageKind::CloseConnection => Ok(Self::CloseConnection),
            MessageKind::AnswerWithSecurity => {
                need(1)?;
                Ok(Self::AnswerWithSecurity(Answer::decode(data[0])))
            },
            MessageKind::StatusRequest => {
                need(6)?;
                Ok(Self::StatusRequest {
                    date: DeviceTime {
                        year: data[0],
                        month: data[1],
                        day: data[2],
                        hour: data[3],
                        minute: data[4],
                        second: data[5],
                    },
                })
            },
            MessageKind::StatusInfo => {
                need(3)?;
                Ok(Self::StatusInfo(StatusInfo {
                    user_right_type: (data[0] & 0x30) >> 4,
                    battery_low: is_bit_set(data[1], 7),
                    pairing_allowed: is_bit_set(data[1], 0),
                    lock_status: LockStatus::from_code(data[2] & 0x07),
                }))
            },
            MessageKind::MountOptionsSet => {
                need(2)?;
                Ok(Self::MountOptionsSet(MountOptions {
                    turn_direction_is_left: is_bit_set(data[0], 0),
                    neutral_position_is_horizontal: is_bit_set(data[0], 1),
                    lock_turns: data[1] & 0x07,
                }))
            },
            MessageKind::Command => {
                need(1)?;
                let command =
                    CommandId::from_code(data[0]).ok_or(ProtocolError::InvalidCommand(data[0]))?;
                Ok(Self::Command { command })
            },
            MessageKind::UserInfo => Ok(Self::UserInfo),
            MessageKind::UserNameSet => {
                need(1 + USER_NAME_LEN)?;
                let field = &data[1..1 + USER_NAME_LEN];
                let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                let user_name = std::str::from_utf8(&field[..end])
                    .map_err(|_| ProtocolError::NameNotUtf8)?
                    .to_string();
                Ok(Self::UserNameSet { user_id: data[0], user_name })
            },
        }
    }
}
