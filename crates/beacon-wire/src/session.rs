//! Session-module messages: channel open, restore, and the
//! challenge-response password proof.

use beacon_types::{ClientCategory, ErrorCode};
use uuid::Uuid;

use crate::codec::{FieldReader, FieldWriter};
use crate::error::WireError;
use crate::{frame, MODULE_SESSION};

/// Inbound operation tags (client → server).
pub const OP_OPEN: u8 = 0x01;
pub const OP_RESTORE: u8 = 0x02;
pub const OP_HASH_AND_KEY2: u8 = 0x03;

/// Outbound operation tags (server → client).
pub const OP_SALT_AND_KEY1: u8 = 0x10;
pub const OP_OPEN_OK: u8 = 0x11;
pub const OP_OPEN_OK2: u8 = 0x12;
pub const OP_RESTORE_OK: u8 = 0x13;
pub const OP_ERROR: u8 = 0x1f;

const TAG_CATEGORY: u8 = 1;
const TAG_CLIENT_KEY: u8 = 2;
const TAG_CHANNEL_ID: u8 = 3;
const TAG_HASH: u8 = 4;
const TAG_KEY2: u8 = 5;
const TAG_SALT: u8 = 6;
const TAG_KEY1: u8 = 7;
const TAG_ERROR_CODE: u8 = 8;

/// Permitted client-key length range.
pub const MIN_CLIENT_KEY_LEN: usize = 4;
pub const MAX_CLIENT_KEY_LEN: usize = 32;

/// Maximum accepted length for salts, keys, and hashes.
const MAX_SECRET_LEN: usize = 64;

/// A message on the session module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Open {
        category: ClientCategory,
        client_key: String,
    },
    Restore {
        category: ClientCategory,
        client_key: String,
        channel_id: Uuid,
    },
    HashAndKey2 {
        hash: Vec<u8>,
        key2: Vec<u8>,
    },
    SaltAndKey1 {
        salt: Vec<u8>,
        key1: Vec<u8>,
    },
    OpenOk {
        channel_id: Uuid,
    },
    OpenOk2,
    RestoreOk,
    Error {
        code: ErrorCode,
    },
}

impl SessionMessage {
    /// Encodes the message into a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        let op = match self {
            Self::Open {
                category,
                client_key,
            } => {
                w.put_u8(TAG_CATEGORY, category.as_u8());
                w.put_str(TAG_CLIENT_KEY, client_key);
                OP_OPEN
            }
            Self::Restore {
                category,
                client_key,
                channel_id,
            } => {
                w.put_u8(TAG_CATEGORY, category.as_u8());
                w.put_str(TAG_CLIENT_KEY, client_key);
                w.put_uid(TAG_CHANNEL_ID, *channel_id);
                OP_RESTORE
            }
            Self::HashAndKey2 { hash, key2 } => {
                w.put_bytes(TAG_HASH, hash);
                w.put_bytes(TAG_KEY2, key2);
                OP_HASH_AND_KEY2
            }
            Self::SaltAndKey1 { salt, key1 } => {
                w.put_bytes(TAG_SALT, salt);
                w.put_bytes(TAG_KEY1, key1);
                OP_SALT_AND_KEY1
            }
            Self::OpenOk { channel_id } => {
                w.put_uid(TAG_CHANNEL_ID, *channel_id);
                OP_OPEN_OK
            }
            Self::OpenOk2 => OP_OPEN_OK2,
            Self::RestoreOk => OP_RESTORE_OK,
            Self::Error { code } => {
                w.put_u16(TAG_ERROR_CODE, code.as_u16());
                OP_ERROR
            }
        };
        frame(MODULE_SESSION, op, w.into_bytes())
    }

    /// Decodes a session-module message body.
    pub fn decode(op: u8, body: &[u8]) -> Result<Self, WireError> {
        let mut r = FieldReader::new(body);
        let msg = match op {
            OP_OPEN => {
                let category = read_category(&mut r)?;
                let client_key = read_client_key(&mut r)?;
                Self::Open {
                    category,
                    client_key,
                }
            }
            OP_RESTORE => {
                let category = read_category(&mut r)?;
                let client_key = read_client_key(&mut r)?;
                let channel_id = r.get_uid(TAG_CHANNEL_ID)?;
                Self::Restore {
                    category,
                    client_key,
                    channel_id,
                }
            }
            OP_HASH_AND_KEY2 => {
                let hash = r.get_bytes(TAG_HASH, MAX_SECRET_LEN)?;
                let key2 = r.get_bytes(TAG_KEY2, MAX_SECRET_LEN)?;
                Self::HashAndKey2 { hash, key2 }
            }
            OP_SALT_AND_KEY1 => {
                let salt = r.get_bytes(TAG_SALT, MAX_SECRET_LEN)?;
                let key1 = r.get_bytes(TAG_KEY1, MAX_SECRET_LEN)?;
                Self::SaltAndKey1 { salt, key1 }
            }
            OP_OPEN_OK => Self::OpenOk {
                channel_id: r.get_uid(TAG_CHANNEL_ID)?,
            },
            OP_OPEN_OK2 => Self::OpenOk2,
            OP_RESTORE_OK => Self::RestoreOk,
            OP_ERROR => {
                let raw = r.get_u16(TAG_ERROR_CODE)?;
                let code = ErrorCode::from_u16(raw).ok_or(WireError::InvalidValue {
                    tag: TAG_ERROR_CODE,
                })?;
                Self::Error { code }
            }
            _ => {
                return Err(WireError::UnknownOp {
                    module: MODULE_SESSION,
                    op,
                })
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

fn read_category(r: &mut FieldReader<'_>) -> Result<ClientCategory, WireError> {
    let raw = r.get_u8(TAG_CATEGORY)?;
    ClientCategory::from_u8(raw).ok_or(WireError::InvalidValue { tag: TAG_CATEGORY })
}

/// Client keys are 4–32 printable ASCII characters; anything else is a
/// format error.
fn read_client_key(r: &mut FieldReader<'_>) -> Result<String, WireError> {
    let key = r.get_str(TAG_CLIENT_KEY, MAX_CLIENT_KEY_LEN)?;
    if key.len() < MIN_CLIENT_KEY_LEN || !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(WireError::InvalidText);
    }
    Ok(key)
}
