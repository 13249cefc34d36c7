//! Event-module messages: subscription synchronization, add/remove,
//! event delivery frames, acknowledgments, and rejections.

use beacon_types::{EventId, EventKind, InstanceId, ServiceId, SubscriptionSpec};
use uuid::Uuid;

use crate::codec::{FieldReader, FieldWriter};
use crate::error::WireError;
use crate::{frame, MODULE_EVENTS};

/// Inbound operation tags (client → server).
pub const OP_SYNC_OK: u8 = 0x01;
pub const OP_SUBSCRIPTIONS: u8 = 0x02;
pub const OP_ADD_SUBSCRIPTION: u8 = 0x03;
pub const OP_REMOVE_SUBSCRIPTION: u8 = 0x04;
pub const OP_REPLACING_EVENT_ACK: u8 = 0x05;
pub const OP_QUEUEING_EVENT_ACK: u8 = 0x06;
pub const OP_PRIVATE_EVENT_ACK: u8 = 0x07;
pub const OP_EVENT_REJECTED: u8 = 0x08;

/// Outbound operation tags (server → client).
pub const OP_SYNC: u8 = 0x10;
pub const OP_ILLEGAL_SUBSCRIPTION: u8 = 0x11;
pub const OP_REPLACING_EVENT: u8 = 0x12;
pub const OP_QUEUEING_EVENT: u8 = 0x13;
pub const OP_PRIVATE_EVENT: u8 = 0x14;
pub const OP_REPLACING_NULL_EVENT: u8 = 0x15;

const TAG_COUNT: u8 = 1;
const TAG_KIND: u8 = 2;
const TAG_NAME: u8 = 3;
const TAG_CURSOR: u8 = 4;
const TAG_EVENT_ID: u8 = 5;
const TAG_TX_UID: u8 = 6;
const TAG_INSTANCE_ID: u8 = 7;
const TAG_SERVICE_ID: u8 = 8;
const TAG_AGE: u8 = 9;
const TAG_CREATED: u8 = 10;
const TAG_ARGS: u8 = 11;
const TAG_DIGEST: u8 = 12;

/// Maximum accepted event-name length.
pub const MAX_EVENT_NAME_LEN: usize = 128;
/// Maximum entries in one client-supplied subscription list.
pub const MAX_SUBSCRIPTION_ENTRIES: usize = 1024;
/// Maximum argument payload carried in one event frame.
pub const MAX_ARGUMENTS_LEN: usize = 65_535;

/// The payload of a delivered event frame, shared by the three kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDelivery {
    pub name: String,
    pub event_id: EventId,
    pub tx_uid: Uuid,
    pub instance_id: InstanceId,
    pub service_id: ServiceId,
    /// Reconstructed wall-clock age in seconds.
    pub age_secs: u64,
    /// Wall-clock creation time, unix seconds.
    pub created_at: i64,
    /// Argument payload; absent for argument-less instances.
    pub arguments: Option<Vec<u8>>,
}

/// A message on the event module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    /// Peer accepts the server-held subscription set as-is.
    SyncOk,
    /// Peer supplies a full replacement (or guest bootstrap) list.
    Subscriptions { entries: Vec<SubscriptionSpec> },
    AddSubscription { kind: EventKind, name: String },
    RemoveSubscription { kind: EventKind, name: String },
    /// Acknowledgment of one delivered instance; the operation tag binds
    /// the kind.
    Ack {
        kind: EventKind,
        event_id: EventId,
        tx_uid: Uuid,
    },
    /// Client-initiated terminal rejection of the in-flight delivery.
    Rejected {
        kind: EventKind,
        event_id: EventId,
        tx_uid: Uuid,
    },
    /// Sync challenge; registered sessions carry the digest of the
    /// persisted set, guest sessions carry none.
    Sync { digest: Option<[u8; 32]> },
    IllegalSubscription { name: String },
    /// A delivered event instance; the operation tag binds the kind.
    Event {
        kind: EventKind,
        delivery: EventDelivery,
    },
    /// Replacing-only explicit reset; carries no argument field.
    ReplacingNull { delivery: EventDelivery },
}

fn ack_op(kind: EventKind) -> u8 {
    match kind {
        EventKind::Replacing => OP_REPLACING_EVENT_ACK,
        EventKind::Queueing => OP_QUEUEING_EVENT_ACK,
        EventKind::Private => OP_PRIVATE_EVENT_ACK,
    }
}

fn event_op(kind: EventKind) -> u8 {
    match kind {
        EventKind::Replacing => OP_REPLACING_EVENT,
        EventKind::Queueing => OP_QUEUEING_EVENT,
        EventKind::Private => OP_PRIVATE_EVENT,
    }
}

impl EventMessage {
    /// Encodes the message into a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        let op = match self {
            Self::SyncOk => OP_SYNC_OK,
            Self::Subscriptions { entries } => {
                w.put_u16(TAG_COUNT, entries.len() as u16);
                for entry in entries {
                    w.put_u8(TAG_KIND, entry.kind.as_u8());
                    w.put_str(TAG_NAME, &entry.name);
                    if let Some(cursor) = entry.last_delivered {
                        w.put_u64(TAG_CURSOR, cursor);
                    }
                }
                OP_SUBSCRIPTIONS
            }
            Self::AddSubscription { kind, name } => {
                w.put_u8(TAG_KIND, kind.as_u8());
                w.put_str(TAG_NAME, name);
                OP_ADD_SUBSCRIPTION
            }
            Self::RemoveSubscription { kind, name } => {
                w.put_u8(TAG_KIND, kind.as_u8());
                w.put_str(TAG_NAME, name);
                OP_REMOVE_SUBSCRIPTION
            }
            Self::Ack {
                kind,
                event_id,
                tx_uid,
            } => {
                w.put_u32(TAG_EVENT_ID, *event_id);
                w.put_uid(TAG_TX_UID, *tx_uid);
                ack_op(*kind)
            }
            Self::Rejected {
                kind,
                event_id,
                tx_uid,
            } => {
                w.put_u8(TAG_KIND, kind.as_u8());
                w.put_u32(TAG_EVENT_ID, *event_id);
                w.put_uid(TAG_TX_UID, *tx_uid);
                OP_EVENT_REJECTED
            }
            Self::Sync { digest } => {
                if let Some(digest) = digest {
                    w.put_bytes(TAG_DIGEST, digest);
                }
                OP_SYNC
            }
            Self::IllegalSubscription { name } => {
                w.put_str(TAG_NAME, name);
                OP_ILLEGAL_SUBSCRIPTION
            }
            Self::Event { kind, delivery } => {
                encode_delivery(&mut w, delivery, true);
                event_op(*kind)
            }
            Self::ReplacingNull { delivery } => {
                encode_delivery(&mut w, delivery, false);
                OP_REPLACING_NULL_EVENT
            }
        };
        frame(MODULE_EVENTS, op, w.into_bytes())
    }

    /// Decodes an event-module message body.
    pub fn decode(op: u8, body: &[u8]) -> Result<Self, WireError> {
        let mut r = FieldReader::new(body);
        let msg = match op {
            OP_SYNC_OK => Self::SyncOk,
            OP_SUBSCRIPTIONS => {
                let count = r.get_u16(TAG_COUNT)? as usize;
                if count > MAX_SUBSCRIPTION_ENTRIES {
                    return Err(WireError::FieldTooLarge {
                        len: count,
                        max: MAX_SUBSCRIPTION_ENTRIES,
                    });
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let kind = read_kind(&mut r)?;
                    let name = r.get_str(TAG_NAME, MAX_EVENT_NAME_LEN)?;
                    let last_delivered = if r.peek_tag() == Some(TAG_CURSOR) {
                        Some(r.get_u64(TAG_CURSOR)?)
                    } else {
                        None
                    };
                    entries.push(SubscriptionSpec {
                        kind,
                        name,
                        last_delivered,
                    });
                }
                Self::Subscriptions { entries }
            }
            OP_ADD_SUBSCRIPTION => Self::AddSubscription {
                kind: read_kind(&mut r)?,
                name: r.get_str(TAG_NAME, MAX_EVENT_NAME_LEN)?,
            },
            OP_REMOVE_SUBSCRIPTION => Self::RemoveSubscription {
                kind: read_kind(&mut r)?,
                name: r.get_str(TAG_NAME, MAX_EVENT_NAME_LEN)?,
            },
            OP_REPLACING_EVENT_ACK | OP_QUEUEING_EVENT_ACK | OP_PRIVATE_EVENT_ACK => {
                let kind = match op {
                    OP_REPLACING_EVENT_ACK => EventKind::Replacing,
                    OP_QUEUEING_EVENT_ACK => EventKind::Queueing,
                    _ => EventKind::Private,
                };
                Self::Ack {
                    kind,
                    event_id: r.get_u32(TAG_EVENT_ID)?,
                    tx_uid: r.get_uid(TAG_TX_UID)?,
                }
            }
            OP_EVENT_REJECTED => Self::Rejected {
                kind: read_kind(&mut r)?,
                event_id: r.get_u32(TAG_EVENT_ID)?,
                tx_uid: r.get_uid(TAG_TX_UID)?,
            },
            OP_SYNC => {
                let digest = if r.peek_tag() == Some(TAG_DIGEST) {
                    let bytes = r.get_bytes(TAG_DIGEST, 32)?;
                    let mut digest = [0u8; 32];
                    if bytes.len() != 32 {
                        return Err(WireError::InvalidValue { tag: TAG_DIGEST });
                    }
                    digest.copy_from_slice(&bytes);
                    Some(digest)
                } else {
                    None
                };
                Self::Sync { digest }
            }
            OP_ILLEGAL_SUBSCRIPTION => Self::IllegalSubscription {
                name: r.get_str(TAG_NAME, MAX_EVENT_NAME_LEN)?,
            },
            OP_REPLACING_EVENT | OP_QUEUEING_EVENT | OP_PRIVATE_EVENT => {
                let kind = match op {
                    OP_REPLACING_EVENT => EventKind::Replacing,
                    OP_QUEUEING_EVENT => EventKind::Queueing,
                    _ => EventKind::Private,
                };
                Self::Event {
                    kind,
                    delivery: decode_delivery(&mut r, true)?,
                }
            }
            OP_REPLACING_NULL_EVENT => Self::ReplacingNull {
                delivery: decode_delivery(&mut r, false)?,
            },
            _ => {
                return Err(WireError::UnknownOp {
                    module: MODULE_EVENTS,
                    op,
                })
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

fn read_kind(r: &mut FieldReader<'_>) -> Result<EventKind, WireError> {
    let raw = r.get_u8(TAG_KIND)?;
    EventKind::from_u8(raw).ok_or(WireError::InvalidValue { tag: TAG_KIND })
}

fn encode_delivery(w: &mut FieldWriter, delivery: &EventDelivery, with_args: bool) {
    w.put_str(TAG_NAME, &delivery.name);
    w.put_u32(TAG_EVENT_ID, delivery.event_id);
    w.put_uid(TAG_TX_UID, delivery.tx_uid);
    w.put_u64(TAG_INSTANCE_ID, delivery.instance_id);
    w.put_u32(TAG_SERVICE_ID, delivery.service_id);
    w.put_u64(TAG_AGE, delivery.age_secs);
    w.put_i64(TAG_CREATED, delivery.created_at);
    if with_args {
        if let Some(args) = &delivery.arguments {
            w.put_bytes(TAG_ARGS, args);
        }
    }
}

fn decode_delivery(r: &mut FieldReader<'_>, with_args: bool) -> Result<EventDelivery, WireError> {
    let name = r.get_str(TAG_NAME, MAX_EVENT_NAME_LEN)?;
    let event_id = r.get_u32(TAG_EVENT_ID)?;
    let tx_uid = r.get_uid(TAG_TX_UID)?;
    let instance_id = r.get_u64(TAG_INSTANCE_ID)?;
    let service_id = r.get_u32(TAG_SERVICE_ID)?;
    let age_secs = r.get_u64(TAG_AGE)?;
    let created_at = r.get_i64(TAG_CREATED)?;
    let arguments = if with_args && r.peek_tag() == Some(TAG_ARGS) {
        Some(r.get_bytes(TAG_ARGS, MAX_ARGUMENTS_LEN)?)
    } else {
        None
    };
    Ok(EventDelivery {
        name,
        event_id,
        tx_uid,
        instance_id,
        service_id,
        age_secs,
        created_at,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameHeader;

    fn round_trip(msg: EventMessage) -> EventMessage {
        let raw = msg.encode();
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.module, MODULE_EVENTS);
        EventMessage::decode(header.op, body).unwrap()
    }

    fn sample_delivery(args: Option<Vec<u8>>) -> EventDelivery {
        EventDelivery {
            name: "status".to_string(),
            event_id: 12,
            tx_uid: Uuid::new_v4(),
            instance_id: 900,
            service_id: 4,
            age_secs: 75,
            created_at: 1_700_000_123,
            arguments: args,
        }
    }

    #[test]
    fn subscription_list_round_trip_with_mixed_cursors() {
        let msg = EventMessage::Subscriptions {
            entries: vec![
                SubscriptionSpec {
                    kind: EventKind::Replacing,
                    name: "status".to_string(),
                    last_delivered: None,
                },
                SubscriptionSpec {
                    kind: EventKind::Queueing,
                    name: "audit".to_string(),
                    last_delivered: Some(41),
                },
            ],
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn ack_op_binds_the_kind() {
        let msg = EventMessage::Ack {
            kind: EventKind::Queueing,
            event_id: 9,
            tx_uid: Uuid::new_v4(),
        };
        let raw = msg.encode();
        let (header, _) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.op, OP_QUEUEING_EVENT_ACK);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn event_with_arguments_round_trip() {
        let msg = EventMessage::Event {
            kind: EventKind::Private,
            delivery: sample_delivery(Some(vec![9, 8, 7])),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn null_event_never_carries_arguments() {
        // Even if the caller leaves a payload on the struct, the null
        // variant encodes without an argument field.
        let msg = EventMessage::ReplacingNull {
            delivery: sample_delivery(Some(vec![1])),
        };
        let raw = msg.encode();
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.op, OP_REPLACING_NULL_EVENT);
        match EventMessage::decode(header.op, body).unwrap() {
            EventMessage::ReplacingNull { delivery } => assert_eq!(delivery.arguments, None),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn sync_digest_is_optional() {
        let with = EventMessage::Sync {
            digest: Some([7u8; 32]),
        };
        let without = EventMessage::Sync { digest: None };
        assert_eq!(round_trip(with.clone()), with);
        assert_eq!(round_trip(without.clone()), without);
    }

    #[test]
    fn oversized_subscription_count_is_rejected() {
        let mut w = FieldWriter::new();
        w.put_u16(1, (MAX_SUBSCRIPTION_ENTRIES + 1) as u16);
        let body = w.into_bytes();
        assert!(matches!(
            EventMessage::decode(OP_SUBSCRIPTIONS, &body),
            Err(WireError::FieldTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_subscription_list_is_rejected() {
        let msg = EventMessage::Subscriptions {
            entries: vec![SubscriptionSpec {
                kind: EventKind::Replacing,
                name: "status".to_string(),
                last_delivered: None,
            }],
        };
        let raw = msg.encode();
        let (header, body) = FrameHeader::parse(&raw).unwrap();
        let cut = &body[..body.len() - 2];
        assert!(EventMessage::decode(header.op, cut).is_err());
    }
}
