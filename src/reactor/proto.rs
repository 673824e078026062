//! Inter-node wire blobs.
//!
//! Versioned CBOR maps with string keys for the two RPC bodies the core
//! originates: leader forwarding and remote sendack return. Decode is strict:
//! unknown keys are skipped, missing required keys are errors.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    ChannelId, ChannelType, ConnId, DeviceId, Framer, NodeId, PendingMessage, ReasonCode,
    SendPacket, SendackPacket, Uid,
};

pub const FORWARD_PROTO_VERSION: u32 = 1;

/// Body of `/wk/channelFoward`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelForwardReq {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub messages: Vec<PendingMessage>,
}

/// One remote publisher's ack inside a `/wk/forwardSendack` body.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardSendack {
    pub uid: Uid,
    pub device_id: DeviceId,
    pub sendack: SendackPacket,
}

/// Body of `/wk/forwardSendack`.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardSendackPacketSet {
    pub packets: Vec<ForwardSendack>,
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("unsupported forward proto version {0}")]
    UnsupportedVersion(u32),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type EncodeResult = Result<(), minicbor::encode::Error<Infallible>>;

fn to_bytes(f: impl FnOnce(&mut Encoder<&mut Vec<u8>>) -> EncodeResult) -> Bytes {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    // writing into a Vec cannot fail
    f(&mut enc).expect("cbor encode to vec");
    Bytes::from(buf)
}

impl ChannelForwardReq {
    pub fn encode(&self) -> Bytes {
        to_bytes(|enc| {
            enc.map(4)?;
            enc.str("v")?.u32(FORWARD_PROTO_VERSION)?;
            enc.str("channel_id")?.str(self.channel_id.as_str())?;
            enc.str("channel_type")?.u8(self.channel_type.as_u8())?;
            enc.str("messages")?.array(self.messages.len() as u64)?;
            for msg in &self.messages {
                encode_message(enc, msg)?;
            }
            Ok(())
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoDecodeError> {
        let mut dec = Decoder::new(bytes);
        let map_len = map_len(&mut dec)?;

        let mut version = None;
        let mut channel_id = None;
        let mut channel_type = None;
        let mut messages = None;

        for _ in 0..map_len {
            match dec.str()? {
                "v" => version = Some(dec.u32()?),
                "channel_id" => channel_id = Some(ChannelId::new(dec.str()?)),
                "channel_type" => channel_type = Some(decode_channel_type(&mut dec)?),
                "messages" => {
                    let len = array_len(&mut dec)?;
                    let mut list = Vec::with_capacity(len.min(1024) as usize);
                    for _ in 0..len {
                        list.push(decode_message(&mut dec)?);
                    }
                    messages = Some(list);
                }
                _ => {
                    dec.skip()?;
                }
            }
        }

        let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
        if version != FORWARD_PROTO_VERSION {
            return Err(ProtoDecodeError::UnsupportedVersion(version));
        }
        Ok(Self {
            channel_id: channel_id.ok_or(ProtoDecodeError::MissingField("channel_id"))?,
            channel_type: channel_type.ok_or(ProtoDecodeError::MissingField("channel_type"))?,
            messages: messages.ok_or(ProtoDecodeError::MissingField("messages"))?,
        })
    }
}

impl ForwardSendackPacketSet {
    pub fn encode(&self) -> Bytes {
        to_bytes(|enc| {
            enc.map(2)?;
            enc.str("v")?.u32(FORWARD_PROTO_VERSION)?;
            enc.str("packets")?.array(self.packets.len() as u64)?;
            for packet in &self.packets {
                enc.map(3)?;
                enc.str("uid")?.str(packet.uid.as_str())?;
                enc.str("device_id")?.str(packet.device_id.as_str())?;
                enc.str("sendack")?;
                encode_sendack(enc, &packet.sendack)?;
            }
            Ok(())
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoDecodeError> {
        let mut dec = Decoder::new(bytes);
        let map_len = map_len(&mut dec)?;

        let mut version = None;
        let mut packets = None;

        for _ in 0..map_len {
            match dec.str()? {
                "v" => version = Some(dec.u32()?),
                "packets" => {
                    let len = array_len(&mut dec)?;
                    let mut list = Vec::with_capacity(len.min(1024) as usize);
                    for _ in 0..len {
                        list.push(decode_forward_sendack(&mut dec)?);
                    }
                    packets = Some(list);
                }
                _ => {
                    dec.skip()?;
                }
            }
        }

        let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
        if version != FORWARD_PROTO_VERSION {
            return Err(ProtoDecodeError::UnsupportedVersion(version));
        }
        Ok(Self {
            packets: packets.ok_or(ProtoDecodeError::MissingField("packets"))?,
        })
    }
}

fn encode_message(enc: &mut Encoder<&mut Vec<u8>>, msg: &PendingMessage) -> EncodeResult {
    enc.map(7)?;
    enc.str("message_id")?.i64(msg.message_id)?;
    enc.str("from_uid")?.str(msg.from_uid.as_str())?;
    enc.str("from_device_id")?.str(msg.from_device_id.as_str())?;
    enc.str("from_node_id")?.u64(msg.from_node_id.get())?;
    enc.str("from_conn_id")?.i64(msg.from_conn_id.get())?;
    enc.str("is_encrypt")?.bool(msg.is_encrypt)?;
    enc.str("packet")?;
    encode_packet(enc, &msg.packet)?;
    Ok(())
}

fn decode_message(dec: &mut Decoder<'_>) -> Result<PendingMessage, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut message_id = None;
    let mut from_uid = None;
    let mut from_device_id = None;
    let mut from_node_id = None;
    let mut from_conn_id = None;
    let mut is_encrypt = None;
    let mut packet = None;

    for _ in 0..map_len {
        match dec.str()? {
            "message_id" => message_id = Some(dec.i64()?),
            "from_uid" => from_uid = Some(Uid::new(dec.str()?)),
            "from_device_id" => from_device_id = Some(DeviceId::new(dec.str()?)),
            "from_node_id" => from_node_id = Some(NodeId::new(dec.u64()?)),
            "from_conn_id" => from_conn_id = Some(ConnId::new(dec.i64()?)),
            "is_encrypt" => is_encrypt = Some(dec.bool()?),
            "packet" => packet = Some(decode_packet(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(PendingMessage {
        message_id: message_id.ok_or(ProtoDecodeError::MissingField("message_id"))?,
        message_seq: 0,
        index: 0,
        from_uid: from_uid.ok_or(ProtoDecodeError::MissingField("from_uid"))?,
        from_device_id: from_device_id
            .ok_or(ProtoDecodeError::MissingField("from_device_id"))?,
        from_node_id: from_node_id.ok_or(ProtoDecodeError::MissingField("from_node_id"))?,
        from_conn_id: from_conn_id.ok_or(ProtoDecodeError::MissingField("from_conn_id"))?,
        is_encrypt: is_encrypt.ok_or(ProtoDecodeError::MissingField("is_encrypt"))?,
        packet: packet.ok_or(ProtoDecodeError::MissingField("packet"))?,
    })
}

fn encode_packet(enc: &mut Encoder<&mut Vec<u8>>, packet: &SendPacket) -> EncodeResult {
    enc.map(9)?;
    enc.str("red_dot")?.bool(packet.framer.red_dot)?;
    enc.str("sync_once")?.bool(packet.framer.sync_once)?;
    enc.str("no_persist")?.bool(packet.framer.no_persist)?;
    enc.str("client_seq")?.u64(packet.client_seq)?;
    enc.str("client_msg_no")?.str(&packet.client_msg_no)?;
    enc.str("channel_id")?.str(packet.channel_id.as_str())?;
    enc.str("channel_type")?.u8(packet.channel_type.as_u8())?;
    enc.str("expire")?.u32(packet.expire)?;
    enc.str("payload")?.bytes(&packet.payload)?;
    Ok(())
}

fn decode_packet(dec: &mut Decoder<'_>) -> Result<SendPacket, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut framer = Framer::default();
    let mut client_seq = None;
    let mut client_msg_no = None;
    let mut channel_id = None;
    let mut channel_type = None;
    let mut expire = None;
    let mut payload = None;

    for _ in 0..map_len {
        match dec.str()? {
            "red_dot" => framer.red_dot = dec.bool()?,
            "sync_once" => framer.sync_once = dec.bool()?,
            "no_persist" => framer.no_persist = dec.bool()?,
            "client_seq" => client_seq = Some(dec.u64()?),
            "client_msg_no" => client_msg_no = Some(dec.str()?.to_string()),
            "channel_id" => channel_id = Some(ChannelId::new(dec.str()?)),
            "channel_type" => channel_type = Some(decode_channel_type(dec)?),
            "expire" => expire = Some(dec.u32()?),
            "payload" => payload = Some(Bytes::copy_from_slice(dec.bytes()?)),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(SendPacket {
        framer,
        client_seq: client_seq.ok_or(ProtoDecodeError::MissingField("client_seq"))?,
        client_msg_no: client_msg_no.ok_or(ProtoDecodeError::MissingField("client_msg_no"))?,
        channel_id: channel_id.ok_or(ProtoDecodeError::MissingField("channel_id"))?,
        channel_type: channel_type.ok_or(ProtoDecodeError::MissingField("channel_type"))?,
        expire: expire.ok_or(ProtoDecodeError::MissingField("expire"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
    })
}

fn encode_sendack(enc: &mut Encoder<&mut Vec<u8>>, sendack: &SendackPacket) -> EncodeResult {
    enc.map(8)?;
    enc.str("red_dot")?.bool(sendack.framer.red_dot)?;
    enc.str("sync_once")?.bool(sendack.framer.sync_once)?;
    enc.str("no_persist")?.bool(sendack.framer.no_persist)?;
    enc.str("message_id")?.i64(sendack.message_id)?;
    enc.str("message_seq")?.u32(sendack.message_seq)?;
    enc.str("client_seq")?.u64(sendack.client_seq)?;
    enc.str("client_msg_no")?.str(&sendack.client_msg_no)?;
    enc.str("reason_code")?.u8(sendack.reason_code.as_u8())?;
    Ok(())
}

fn decode_forward_sendack(dec: &mut Decoder<'_>) -> Result<ForwardSendack, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut uid = None;
    let mut device_id = None;
    let mut sendack = None;

    for _ in 0..map_len {
        match dec.str()? {
            "uid" => uid = Some(Uid::new(dec.str()?)),
            "device_id" => device_id = Some(DeviceId::new(dec.str()?)),
            "sendack" => sendack = Some(decode_sendack(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(ForwardSendack {
        uid: uid.ok_or(ProtoDecodeError::MissingField("uid"))?,
        device_id: device_id.ok_or(ProtoDecodeError::MissingField("device_id"))?,
        sendack: sendack.ok_or(ProtoDecodeError::MissingField("sendack"))?,
    })
}

fn decode_sendack(dec: &mut Decoder<'_>) -> Result<SendackPacket, ProtoDecodeError> {
    let map_len = map_len(dec)?;
    let mut framer = Framer::default();
    let mut message_id = None;
    let mut message_seq = None;
    let mut client_seq = None;
    let mut client_msg_no = None;
    let mut reason_code = None;

    for _ in 0..map_len {
        match dec.str()? {
            "red_dot" => framer.red_dot = dec.bool()?,
            "sync_once" => framer.sync_once = dec.bool()?,
            "no_persist" => framer.no_persist = dec.bool()?,
            "message_id" => message_id = Some(dec.i64()?),
            "message_seq" => message_seq = Some(dec.u32()?),
            "client_seq" => client_seq = Some(dec.u64()?),
            "client_msg_no" => client_msg_no = Some(dec.str()?.to_string()),
            "reason_code" => {
                let raw = dec.u8()?;
                reason_code =
                    Some(ReasonCode::from_u8(raw).ok_or(ProtoDecodeError::InvalidField {
                        field: "reason_code",
                        reason: format!("unknown value {raw}"),
                    })?);
            }
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(SendackPacket {
        framer,
        message_id: message_id.ok_or(ProtoDecodeError::MissingField("message_id"))?,
        message_seq: message_seq.ok_or(ProtoDecodeError::MissingField("message_seq"))?,
        client_seq: client_seq.ok_or(ProtoDecodeError::MissingField("client_seq"))?,
        client_msg_no: client_msg_no.ok_or(ProtoDecodeError::MissingField("client_msg_no"))?,
        reason_code: reason_code.ok_or(ProtoDecodeError::MissingField("reason_code"))?,
    })
}

fn map_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    dec.map()?.ok_or(ProtoDecodeError::InvalidField {
        field: "map",
        reason: "indefinite-length map not allowed".into(),
    })
}

fn array_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    dec.array()?.ok_or(ProtoDecodeError::InvalidField {
        field: "array",
        reason: "indefinite-length array not allowed".into(),
    })
}

fn decode_channel_type(dec: &mut Decoder<'_>) -> Result<ChannelType, ProtoDecodeError> {
    let raw = dec.u8()?;
    ChannelType::from_u8(raw).ok_or(ProtoDecodeError::InvalidField {
        field: "channel_type",
        reason: format!("unknown value {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> PendingMessage {
        PendingMessage {
            message_id: 42,
            message_seq: 0,
            index: 0,
            from_uid: Uid::new("u1"),
            from_device_id: DeviceId::new("d1"),
            from_node_id: NodeId::new(3),
            from_conn_id: ConnId::new(7),
            is_encrypt: false,
            packet: SendPacket {
                framer: Framer {
                    red_dot: true,
                    sync_once: false,
                    no_persist: false,
                },
                client_seq: 12,
                client_msg_no: "cm-12".into(),
                channel_id: ChannelId::new("room"),
                channel_type: ChannelType::Group,
                expire: 60,
                payload: Bytes::from_static(b"payload"),
            },
        }
    }

    #[test]
    fn channel_forward_round_trip() {
        let req = ChannelForwardReq {
            channel_id: ChannelId::new("room"),
            channel_type: ChannelType::Group,
            messages: vec![sample_message(), sample_message()],
        };
        let decoded = ChannelForwardReq::decode(&req.encode()).expect("decode");
        assert_eq!(decoded, req);
    }

    #[test]
    fn forward_sendack_round_trip() {
        let set = ForwardSendackPacketSet {
            packets: vec![ForwardSendack {
                uid: Uid::new("u1"),
                device_id: DeviceId::new("d1"),
                sendack: SendackPacket {
                    framer: Framer::default(),
                    message_id: 42,
                    message_seq: 9,
                    client_seq: 12,
                    client_msg_no: "cm-12".into(),
                    reason_code: ReasonCode::InBlacklist,
                },
            }],
        };
        let decoded = ForwardSendackPacketSet::decode(&set.encode()).expect("decode");
        assert_eq!(decoded, set);
    }

    #[test]
    fn missing_field_is_an_error() {
        let bytes = to_bytes(|enc| {
            enc.map(1)?;
            enc.str("v")?.u32(FORWARD_PROTO_VERSION)?;
            Ok(())
        });
        let err = ChannelForwardReq::decode(&bytes).expect_err("must fail");
        assert!(matches!(err, ProtoDecodeError::MissingField("channel_id")));
    }

    #[test]
    fn future_version_is_rejected() {
        let bytes = to_bytes(|enc| {
            enc.map(1)?;
            enc.str("v")?.u32(99)?;
            Ok(())
        });
        let err = ForwardSendackPacketSet::decode(&bytes).expect_err("must fail");
        assert!(matches!(err, ProtoDecodeError::UnsupportedVersion(99)));
    }
}
