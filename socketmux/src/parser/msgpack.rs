//! The single-blob framing: the whole packet, header fields included, as
//! one self-describing msgpack document. Binary leaves travel inline so no
//! attachment frames or placeholders are needed; every packet is exactly
//! one binary frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Decoded, Parse, ParseError, Payload};
use crate::packet::{Packet, PacketData};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct MsgPackParser;

/// The wire layout of a packet.
#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    r#type: u8,
    nsp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
}

impl Parse for MsgPackParser {
    fn encode(&self, packet: Packet) -> Result<(Payload, Vec<Bytes>), ParseError> {
        let r#type = packet.inner.index();
        let id = packet.inner.ack_id();
        let data = match packet.inner {
            PacketData::Connect(auth) => auth,
            PacketData::Disconnect => None,
            PacketData::ConnectError(message) => Some(Value::Object(
                [("message".to_string(), Value::String(message))]
                    .into_iter()
                    .collect(),
            )),
            PacketData::Event(event, args, _) | PacketData::BinaryEvent(event, args, _) => {
                let mut payload = Vec::with_capacity(args.len() + 1);
                payload.push(Value::String(event));
                payload.extend(args);
                Some(Value::Array(payload))
            }
            PacketData::EventAck(args, _) | PacketData::BinaryAck(args, _) => {
                Some(Value::Array(args))
            }
        };
        let wire = WirePacket {
            r#type,
            nsp: packet.ns.into_owned(),
            data,
            id,
        };
        let buf = rmp_serde::encode::to_vec_named(&wire)?;
        Ok((Payload::Binary(buf.into()), Vec::new()))
    }

    fn decode_text(&self, _data: &str) -> Result<Decoded, ParseError> {
        Err(ParseError::UnexpectedStringPacket)
    }

    fn decode_binary(&self, data: Bytes) -> Result<Decoded, ParseError> {
        let wire: WirePacket = rmp_serde::decode::from_slice(&data)?;
        let ns = std::borrow::Cow::Owned(wire.nsp);
        let inner = match wire.r#type {
            0 => PacketData::Connect(wire.data),
            1 => PacketData::Disconnect,
            2 | 5 => {
                let (event, args) = split_event(wire.data)?;
                if wire.r#type == 5 {
                    PacketData::BinaryEvent(event, args, wire.id)
                } else {
                    PacketData::Event(event, args, wire.id)
                }
            }
            3 | 6 => {
                let args = match wire.data {
                    Some(Value::Array(args)) => args,
                    None => Vec::new(),
                    _ => return Err(ParseError::InvalidPayload),
                };
                let id = wire.id.ok_or(ParseError::InvalidAckId)?;
                if wire.r#type == 6 {
                    PacketData::BinaryAck(args, id)
                } else {
                    PacketData::EventAck(args, id)
                }
            }
            4 => PacketData::ConnectError(error_message(wire.data)?),
            _ => return Err(ParseError::InvalidPacketType),
        };
        Ok(Decoded::Packet(Packet { ns, inner }))
    }
}

fn split_event(data: Option<Value>) -> Result<(String, Vec<Value>), ParseError> {
    let mut args = match data {
        Some(Value::Array(args)) => args,
        _ => return Err(ParseError::InvalidPayload),
    };
    if args.is_empty() {
        return Err(ParseError::InvalidEventName);
    }
    match args.remove(0) {
        Value::String(event) => Ok((event, args)),
        _ => Err(ParseError::InvalidEventName),
    }
}

fn error_message(data: Option<Value>) -> Result<String, ParseError> {
    match data {
        Some(Value::String(message)) => Ok(message),
        Some(Value::Object(map)) => match map.get("message") {
            Some(Value::String(message)) => Ok(message.clone()),
            _ => Err(ParseError::InvalidPayload),
        },
        None => Ok(String::new()),
        _ => Err(ParseError::InvalidPayload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginemux::Sid;

    fn roundtrip(packet: Packet) -> Packet {
        let (head, bins) = MsgPackParser.encode(packet).unwrap();
        assert!(bins.is_empty(), "msgpack packets are a single frame");
        let frame = match head {
            Payload::Binary(frame) => frame,
            Payload::Text(_) => panic!("msgpack parser emits binary heads"),
        };
        match MsgPackParser.decode_binary(frame).unwrap() {
            Decoded::Packet(packet) => packet,
            Decoded::Partial(_) => panic!("msgpack packets are never partial"),
        }
    }

    #[test]
    fn roundtrip_connect() {
        let packet = Packet::connect("/", Sid::new());
        assert_eq!(roundtrip(packet.clone()), packet);

        let packet = Packet::connect_request("/admin™", None);
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_disconnect() {
        let packet = Packet::disconnect("/chat");
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_event() {
        let packet = Packet::event(
            "/",
            "event",
            vec![Value::from(serde_json::json!({"data": "value™"}))],
        );
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_event_with_ack() {
        let mut packet = Packet::event("/admin", "event", vec![Value::from(1i64)]);
        packet.inner.set_ack_id(254);
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_ack() {
        let packet = Packet::ack("/", vec![Value::from("data")], 54);
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_binary_event_single_frame() {
        let packet = Packet::event(
            "/",
            "binary",
            vec![
                Value::from("meta"),
                Value::from(Bytes::from_static(&[1, 2, 3, 4])),
            ],
        );
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_binary_ack_nested() {
        let packet = Packet::ack(
            "/files",
            vec![Value::Array(vec![
                Value::from(Bytes::from_static(&[9, 9])),
                Value::Object(
                    [(
                        "blob".to_string(),
                        Value::from(Bytes::from_static(&[1, 2, 3])),
                    )]
                    .into_iter()
                    .collect(),
                ),
            ])],
            7,
        );
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn roundtrip_connect_error() {
        let packet = Packet::invalid_namespace("/nope");
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn text_frames_are_rejected() {
        assert!(matches!(
            MsgPackParser.decode_text("2[\"e\"]"),
            Err(ParseError::UnexpectedStringPacket)
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            MsgPackParser.decode_binary(Bytes::from_static(&[0xc1, 0x00])),
            Err(ParseError::MsgPackDecode(_))
        ));
    }
}
