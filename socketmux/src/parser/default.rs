//! The default framing: a textual header packet followed by one binary
//! frame per attachment.
//!
//! Header layout:
//!
//! ```text
//! <type digit>[<attachments>-][/<namespace>,][<ack id>]<json payload>
//! ```
//!
//! Binary leaves are lifted out of the payload and replaced by
//! `{"_placeholder":true,"num":N}` objects, `N` being the zero-based index
//! into the attachment stream. Decoding buffers the declared number of
//! attachment frames, then substitutes each placeholder by its index,
//! independent of arrival order.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;

use super::{Decoded, Parse, ParseError, Payload};
use crate::packet::{Packet, PacketData};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct DefaultParser;

impl Parse for DefaultParser {
    fn encode(&self, mut packet: Packet) -> Result<(Payload, Vec<Bytes>), ParseError> {
        let mut attachments = Vec::new();

        // Lift binary leaves out before the payload is serialized to JSON.
        match &mut packet.inner {
            PacketData::BinaryEvent(_, args, _) | PacketData::BinaryAck(args, _) => {
                for arg in args.iter_mut() {
                    extract_attachments(arg, &mut attachments);
                }
            }
            _ => {}
        }

        let payload = match &packet.inner {
            PacketData::Connect(Some(auth)) => Some(serde_json::to_string(auth)?),
            PacketData::Connect(None) | PacketData::Disconnect => None,
            PacketData::ConnectError(message) => Some(serde_json::to_string(message)?),
            PacketData::Event(event, args, _) | PacketData::BinaryEvent(event, args, _) => {
                let mut payload = Vec::with_capacity(args.len() + 1);
                payload.push(Value::String(event.clone()));
                payload.extend(args.iter().cloned());
                Some(serde_json::to_string(&payload)?)
            }
            PacketData::EventAck(args, _) | PacketData::BinaryAck(args, _) => {
                Some(serde_json::to_string(args)?)
            }
        };

        let mut head = String::with_capacity(
            8 + packet.ns.len() + payload.as_deref().map(str::len).unwrap_or(0),
        );
        head.push((b'0' + packet.inner.index()) as char);

        if packet.inner.is_binary() {
            head.push_str(&attachments.len().to_string());
            head.push('-');
        }

        let id = packet.inner.ack_id();
        if packet.ns != "/" {
            head.push_str(&packet.ns);
            if id.is_some() || payload.is_some() {
                head.push(',');
            }
        }
        if let Some(id) = id {
            head.push_str(&id.to_string());
        }
        if let Some(payload) = payload {
            head.push_str(&payload);
        }

        Ok((Payload::Text(head), attachments))
    }

    fn decode_text(&self, data: &str) -> Result<Decoded, ParseError> {
        // Delimiters are all ASCII, so a byte cursor is safe even with a
        // multibyte namespace.
        let bytes = data.as_bytes();
        let index = match bytes.first() {
            Some(i @ b'0'..=b'6') => *i,
            _ => return Err(ParseError::InvalidPacketType),
        };
        let mut i = 1;

        // Declared attachment count, only present on binary packets.
        let attachments = if index == b'5' || index == b'6' {
            let start = i;
            while bytes.get(i).is_some_and(u8::is_ascii_digit) {
                i += 1;
            }
            if bytes.get(i) != Some(&b'-') || i == start {
                return Err(ParseError::InvalidPacketType);
            }
            let count = data[start..i]
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidPacketType)?;
            // Every attachment needs a placeholder in the payload, so a
            // count beyond the header length is garbage.
            if count > data.len() {
                return Err(ParseError::AttachmentMismatch);
            }
            i += 1;
            count
        } else {
            0
        };

        // Custom namespaces start with a slash and usually end with a
        // comma; the comma is absent when nothing follows, and some peers
        // omit it right before the payload.
        let ns: Cow<'static, str> = if bytes.get(i) == Some(&b'/') {
            let start = i;
            loop {
                match bytes.get(i) {
                    Some(b',') => {
                        let ns = data[start..i].to_string();
                        i += 1;
                        break Cow::Owned(ns);
                    }
                    Some(b'"') | Some(b'{') | Some(b'[') | None => {
                        break Cow::Owned(data[start..i].to_string())
                    }
                    Some(_) => i += 1,
                }
            }
        } else {
            Cow::Borrowed("/")
        };

        let start = i;
        let ack: Option<i64> = loop {
            match bytes.get(i) {
                Some(c) if c.is_ascii_digit() => i += 1,
                Some(b'[') | Some(b'{') | Some(b'"') | None if i > start => {
                    break data[start..i].parse().ok()
                }
                _ => break None,
            }
        };

        let payload = &data[i..];
        let inner = match index {
            b'0' => PacketData::Connect(decode_optional_value(payload)?),
            b'1' => PacketData::Disconnect,
            b'2' => {
                let (event, args) = decode_event_payload(payload)?;
                PacketData::Event(event, args, ack)
            }
            b'3' => {
                let args = decode_args(payload)?;
                PacketData::EventAck(args, ack.ok_or(ParseError::InvalidAckId)?)
            }
            b'4' => PacketData::ConnectError(decode_error_payload(payload)?),
            b'5' => {
                let (event, args) = decode_event_payload(payload)?;
                validate_placeholders(&args, attachments)?;
                PacketData::BinaryEvent(event, args, ack)
            }
            b'6' => {
                let args = decode_args(payload)?;
                validate_placeholders(&args, attachments)?;
                PacketData::BinaryAck(args, ack.ok_or(ParseError::InvalidAckId)?)
            }
            _ => unreachable!("opcode range checked above"),
        };

        let packet = Packet { ns, inner };
        if attachments > 0 {
            Ok(Decoded::Partial(PartialPacket {
                packet,
                declared: attachments,
                attachments: Vec::new(),
            }))
        } else {
            Ok(Decoded::Packet(packet))
        }
    }

    fn decode_binary(&self, _data: Bytes) -> Result<Decoded, ParseError> {
        // Attachments are fed to a pending [`PartialPacket`] by the
        // session glue; a binary frame with no pending header is a
        // protocol violation.
        Err(ParseError::UnexpectedBinaryPacket)
    }
}

/// A decoded header still waiting for its attachment frames.
#[derive(Debug)]
pub struct PartialPacket {
    packet: Packet,
    declared: usize,
    attachments: Vec<Bytes>,
}

impl PartialPacket {
    /// The namespace the pending packet is addressed to.
    pub fn ns(&self) -> &str {
        &self.packet.ns
    }

    /// Buffer the next attachment frame. Once the declared count is
    /// reached the placeholders are substituted and the completed packet
    /// is returned.
    pub fn add_attachment(mut self, data: Bytes) -> Result<Decoded, ParseError> {
        self.attachments.push(data);
        if self.attachments.len() < self.declared {
            return Ok(Decoded::Partial(self));
        }

        let PartialPacket {
            mut packet,
            attachments,
            ..
        } = self;
        match &mut packet.inner {
            PacketData::BinaryEvent(_, args, _) | PacketData::BinaryAck(args, _) => {
                for arg in args.iter_mut() {
                    substitute_attachments(arg, &attachments)?;
                }
            }
            _ => return Err(ParseError::UnexpectedBinaryPacket),
        }
        Ok(Decoded::Packet(packet))
    }
}

/// Replace binary leaves with placeholder objects, appending each blob to
/// the attachment stream in traversal order.
fn extract_attachments(value: &mut Value, attachments: &mut Vec<Bytes>) {
    match value {
        Value::Binary(data) => {
            let num = attachments.len();
            attachments.push(std::mem::take(data));
            *value = placeholder(num);
        }
        Value::Array(values) => {
            for v in values {
                extract_attachments(v, attachments);
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                extract_attachments(v, attachments);
            }
        }
        _ => {}
    }
}

/// Replace placeholder objects with the blob at their index. Substitution
/// matches by `num`, not by arrival order.
fn substitute_attachments(value: &mut Value, attachments: &[Bytes]) -> Result<(), ParseError> {
    match value {
        Value::Object(map) => {
            if let Some(num) = placeholder_index(map) {
                let data = attachments
                    .get(num)
                    .ok_or(ParseError::UnknownPlaceholder(num))?;
                *value = Value::Binary(data.clone());
                return Ok(());
            }
            for v in map.values_mut() {
                substitute_attachments(v, attachments)?;
            }
        }
        Value::Array(values) => {
            for v in values {
                substitute_attachments(v, attachments)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Check that the placeholders of a decoded payload reference exactly the
/// declared attachment indices, each one once.
fn validate_placeholders(args: &[Value], declared: usize) -> Result<(), ParseError> {
    let mut seen = vec![false; declared];
    let mut count = 0usize;
    for arg in args {
        collect_placeholders(arg, &mut seen, &mut count)?;
    }
    if count != declared || !seen.iter().all(|s| *s) {
        return Err(ParseError::AttachmentMismatch);
    }
    Ok(())
}

fn collect_placeholders(
    value: &Value,
    seen: &mut [bool],
    count: &mut usize,
) -> Result<(), ParseError> {
    match value {
        Value::Object(map) => {
            if let Some(num) = placeholder_index(map) {
                let slot = seen.get_mut(num).ok_or(ParseError::UnknownPlaceholder(num))?;
                if *slot {
                    return Err(ParseError::AttachmentMismatch);
                }
                *slot = true;
                *count += 1;
                return Ok(());
            }
            for v in map.values() {
                collect_placeholders(v, seen, count)?;
            }
        }
        Value::Array(values) => {
            for v in values {
                collect_placeholders(v, seen, count)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn placeholder(num: usize) -> Value {
    Value::Object(BTreeMap::from([
        ("_placeholder".to_string(), Value::Bool(true)),
        ("num".to_string(), Value::Number(num.into())),
    ]))
}

fn placeholder_index(map: &BTreeMap<String, Value>) -> Option<usize> {
    match (map.get("_placeholder"), map.get("num")) {
        (Some(Value::Bool(true)), Some(Value::Number(num))) => {
            num.as_u64().map(|num| num as usize)
        }
        _ => None,
    }
}

fn decode_optional_value(payload: &str) -> Result<Option<Value>, ParseError> {
    if payload.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_str(payload)?))
    }
}

fn decode_args(payload: &str) -> Result<Vec<Value>, ParseError> {
    match serde_json::from_str(payload)? {
        Value::Array(args) => Ok(args),
        _ => Err(ParseError::InvalidPayload),
    }
}

fn decode_event_payload(payload: &str) -> Result<(String, Vec<Value>), ParseError> {
    let mut args = decode_args(payload)?;
    if args.is_empty() {
        return Err(ParseError::InvalidEventName);
    }
    match args.remove(0) {
        Value::String(event) => Ok((event, args)),
        _ => Err(ParseError::InvalidEventName),
    }
}

fn decode_error_payload(payload: &str) -> Result<String, ParseError> {
    if payload.is_empty() {
        return Ok(String::new());
    }
    match serde_json::from_str::<Value>(payload)? {
        Value::String(message) => Ok(message),
        // Some peers wrap the message in an object.
        Value::Object(map) => match map.get("message") {
            Some(Value::String(message)) => Ok(message.clone()),
            _ => Err(ParseError::InvalidPayload),
        },
        _ => Err(ParseError::InvalidPayload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginemux::Sid;

    fn encode(packet: Packet) -> (String, Vec<Bytes>) {
        let (head, bins) = DefaultParser.encode(packet).unwrap();
        match head {
            Payload::Text(head) => (head, bins),
            Payload::Binary(_) => panic!("default parser emits text heads"),
        }
    }

    fn decode_complete(data: &str) -> Packet {
        match DefaultParser.decode_text(data).unwrap() {
            Decoded::Packet(packet) => packet,
            Decoded::Partial(_) => panic!("expected a complete packet"),
        }
    }

    fn decode_with_attachments(data: &str, attachments: Vec<Bytes>) -> Packet {
        let mut decoded = DefaultParser.decode_text(data).unwrap();
        for bin in attachments {
            decoded = match decoded {
                Decoded::Partial(partial) => partial.add_attachment(bin).unwrap(),
                Decoded::Packet(_) => panic!("attachment after completion"),
            };
        }
        match decoded {
            Decoded::Packet(packet) => packet,
            Decoded::Partial(_) => panic!("packet still incomplete"),
        }
    }

    #[test]
    fn encode_event_root_ns() {
        let (head, bins) = encode(Packet::event(
            "/",
            "echo",
            vec![Value::from("hi")],
        ));
        assert_eq!(head, r#"2["echo","hi"]"#);
        assert!(bins.is_empty());
    }

    #[test]
    fn encode_event_with_ns_and_ack() {
        let mut packet = Packet::event("/x", "echo", vec![Value::from("hi")]);
        packet.inner.set_ack_id(7);
        let (head, _) = encode(packet);
        assert_eq!(head, r#"2/x,7["echo","hi"]"#);
    }

    #[test]
    fn encode_ack_with_ns() {
        let (head, _) = encode(Packet::ack("/x", vec![Value::from("hi")], 7));
        assert_eq!(head, r#"3/x,7["hi"]"#);
    }

    #[test]
    fn encode_connect() {
        let sid = Sid::new();
        let (head, _) = encode(Packet::connect("/", sid));
        assert_eq!(head, format!("0{{\"sid\":\"{sid}\"}}"));

        let (head, _) = encode(Packet::connect_request("/ditto", None));
        assert_eq!(head, "0/ditto");
    }

    #[test]
    fn encode_disconnect() {
        let (head, _) = encode(Packet::disconnect("/"));
        assert_eq!(head, "1");
        let (head, _) = encode(Packet::disconnect("/ditto"));
        assert_eq!(head, "1/ditto");
    }

    #[test]
    fn encode_connect_error() {
        let (head, _) = encode(Packet::invalid_namespace("/ditto"));
        assert_eq!(head, "4/ditto,\"Invalid namespace\"");

        let (head, _) = encode(Packet::invalid_namespace("/"));
        assert_eq!(head, "4\"Invalid namespace\"");
    }

    #[test]
    fn encode_binary_event() {
        let (head, bins) = encode(Packet::event(
            "/",
            "binary",
            vec![Value::from(Bytes::from_static(&[1, 2, 3, 4]))],
        ));
        assert_eq!(head, r#"51-["binary",{"_placeholder":true,"num":0}]"#);
        assert_eq!(bins, vec![Bytes::from_static(&[1, 2, 3, 4])]);
    }

    #[test]
    fn encode_binary_event_nested() {
        let args = vec![
            Value::from("files"),
            Value::Array(vec![
                Value::from(Bytes::from_static(&[1])),
                Value::Object(BTreeMap::from([(
                    "inner".to_string(),
                    Value::from(Bytes::from_static(&[2])),
                )])),
            ]),
        ];
        let (head, bins) = encode(Packet::event("/", "upload", args));
        assert_eq!(
            head,
            r#"52-["upload","files",[{"_placeholder":true,"num":0},{"inner":{"_placeholder":true,"num":1}}]]"#
        );
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0], Bytes::from_static(&[1]));
        assert_eq!(bins[1], Bytes::from_static(&[2]));
    }

    #[test]
    fn decode_event_root_ns() {
        let packet = decode_complete(r#"2["echo","hi"]"#);
        assert_eq!(packet, Packet::event("/", "echo", vec![Value::from("hi")]));
    }

    #[test]
    fn decode_event_with_ns_and_ack() {
        let packet = decode_complete(r#"2/x,7["echo","hi"]"#);
        let mut expected = Packet::event("/x", "echo", vec![Value::from("hi")]);
        expected.inner.set_ack_id(7);
        assert_eq!(packet, expected);
    }

    #[test]
    fn decode_ack() {
        let packet = decode_complete(r#"3/x,7["hi"]"#);
        assert_eq!(packet, Packet::ack("/x", vec![Value::from("hi")], 7));
    }

    #[test]
    fn decode_ack_requires_id() {
        assert!(matches!(
            DefaultParser.decode_text(r#"3["hi"]"#),
            Err(ParseError::InvalidAckId)
        ));
    }

    #[test]
    fn decode_connect_and_disconnect() {
        let packet = decode_complete("0/ditto");
        assert_eq!(packet, Packet::connect_request("/ditto", None));

        // A trailing comma is also legal when nothing follows.
        let packet = decode_complete("0/ditto,");
        assert_eq!(packet, Packet::connect_request("/ditto", None));

        let packet = decode_complete("1/ditto");
        assert_eq!(packet, Packet::disconnect("/ditto"));
    }

    #[test]
    fn decode_connect_error() {
        let packet = decode_complete("4/ditto,\"Invalid namespace\"");
        assert_eq!(packet, Packet::invalid_namespace("/ditto"));

        // Namespace not separated from the payload by a comma.
        let packet = decode_complete("4/ditto\"Invalid namespace\"");
        assert_eq!(packet, Packet::invalid_namespace("/ditto"));

        // Object-wrapped message from other implementations.
        let packet = decode_complete("4/ditto,{\"message\":\"Invalid namespace\"}");
        assert_eq!(packet, Packet::invalid_namespace("/ditto"));
    }

    #[test]
    fn decode_binary_event() {
        let packet = decode_with_attachments(
            r#"51-["binary",{"_placeholder":true,"num":0}]"#,
            vec![Bytes::from_static(&[1, 2, 3, 4])],
        );
        assert_eq!(
            packet,
            Packet::event(
                "/",
                "binary",
                vec![Value::from(Bytes::from_static(&[1, 2, 3, 4]))]
            )
        );
    }

    #[test]
    fn decode_substitutes_by_index_not_arrival_order() {
        // Placeholders appear reversed in the payload; each still gets the
        // blob matching its index.
        let packet = decode_with_attachments(
            r#"52-["pair",{"_placeholder":true,"num":1},{"_placeholder":true,"num":0}]"#,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")],
        );
        assert_eq!(
            packet,
            Packet::event(
                "/",
                "pair",
                vec![
                    Value::from(Bytes::from_static(b"second")),
                    Value::from(Bytes::from_static(b"first")),
                ]
            )
        );
    }

    #[test]
    fn decode_binary_ack_roundtrip() {
        let packet = Packet::ack(
            "/x",
            vec![Value::from("ok"), Value::from(Bytes::from_static(&[7]))],
            42,
        );
        let (head, bins) = encode(packet.clone());
        assert_eq!(head, r#"61-/x,42["ok",{"_placeholder":true,"num":0}]"#);
        let decoded = decode_with_attachments(&head, bins);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_rejects_unknown_placeholder() {
        assert!(matches!(
            DefaultParser.decode_text(r#"51-["e",{"_placeholder":true,"num":3}]"#),
            Err(ParseError::UnknownPlaceholder(3))
        ));
    }

    #[test]
    fn decode_rejects_placeholder_count_mismatch() {
        // Declares two attachments but references only one.
        assert!(matches!(
            DefaultParser.decode_text(r#"52-["e",{"_placeholder":true,"num":0}]"#),
            Err(ParseError::AttachmentMismatch)
        ));
        // References the same index twice.
        assert!(matches!(
            DefaultParser.decode_text(
                r#"52-["e",{"_placeholder":true,"num":0},{"_placeholder":true,"num":0}]"#
            ),
            Err(ParseError::AttachmentMismatch)
        ));
    }

    #[test]
    fn decode_rejects_bad_opcode() {
        assert!(matches!(
            DefaultParser.decode_text("9[]"),
            Err(ParseError::InvalidPacketType)
        ));
        assert!(matches!(
            DefaultParser.decode_text(""),
            Err(ParseError::InvalidPacketType)
        ));
    }

    #[test]
    fn decode_rejects_missing_attachment_count() {
        assert!(matches!(
            DefaultParser.decode_text(r#"5-["e"]"#),
            Err(ParseError::InvalidPacketType)
        ));
    }

    #[test]
    fn decode_rejects_bad_event_name() {
        assert!(matches!(
            DefaultParser.decode_text("2[42]"),
            Err(ParseError::InvalidEventName)
        ));
        assert!(matches!(
            DefaultParser.decode_text("2{}"),
            Err(ParseError::InvalidPayload)
        ));
    }

    #[test]
    fn unexpected_binary_frame_is_an_error() {
        assert!(matches!(
            DefaultParser.decode_binary(Bytes::from_static(&[1])),
            Err(ParseError::UnexpectedBinaryPacket)
        ));
    }

    #[test]
    fn roundtrip_unicode_namespace() {
        let mut packet = Packet::event(
            "/admin™",
            "event",
            vec![Value::from(serde_json::json!({"data": "value™"}))],
        );
        packet.inner.set_ack_id(1);
        let (head, _) = encode(packet.clone());
        assert_eq!(head, r#"2/admin™,1["event",{"data":"value™"}]"#);
        assert_eq!(decode_complete(&head), packet);
    }

    #[test]
    fn roundtrip_mixed_payloads() {
        let packets = vec![
            Packet::event("/", "e", vec![]),
            Packet::event("/deep", "e", vec![Value::Null, Value::from(3i64)]),
            Packet::ack("/", vec![], 1),
            Packet::event(
                "/mix",
                "m",
                vec![
                    Value::from("text"),
                    Value::from(Bytes::from_static(&[1])),
                    Value::Object(BTreeMap::from([(
                        "blob".to_string(),
                        Value::from(Bytes::from_static(&[2, 3])),
                    )])),
                ],
            ),
        ];
        for packet in packets {
            let (head, bins) = encode(packet.clone());
            let decoded = decode_with_attachments(&head, bins);
            assert_eq!(decoded, packet);
        }
    }
}
