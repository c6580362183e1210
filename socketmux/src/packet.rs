use std::borrow::Cow;

use enginemux::Sid;

use crate::value::Value;

/// An application-layer packet: a payload bound to a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub ns: Cow<'static, str>,
    pub inner: PacketData,
}

/// | Type          | ID  | Usage                                                 |
/// |---------------|-----|-------------------------------------------------------|
/// | CONNECT       | 0   | Open a namespace on an engine session.                |
/// | DISCONNECT    | 1   | Close a namespace, the session stays up.              |
/// | EVENT         | 2   | A named event with arguments.                         |
/// | ACK           | 3   | The reply correlated to an EVENT that carried an id.  |
/// | CONNECT_ERROR | 4   | Connection refused, or a namespace-scoped error.      |
/// | BINARY_EVENT  | 5   | EVENT whose arguments contain binary leaves.          |
/// | BINARY_ACK    | 6   | ACK whose arguments contain binary leaves.            |
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Connect(Option<Value>),
    Disconnect,
    Event(String, Vec<Value>, Option<i64>),
    EventAck(Vec<Value>, i64),
    ConnectError(String),
    BinaryEvent(String, Vec<Value>, Option<i64>),
    BinaryAck(Vec<Value>, i64),
}

impl Packet {
    /// The CONNECT reply sent by the server, carrying the session id.
    pub fn connect(ns: impl Into<Cow<'static, str>>, sid: Sid) -> Self {
        let payload = Value::Object(
            [("sid".to_string(), Value::String(sid.to_string()))]
                .into_iter()
                .collect(),
        );
        Self {
            inner: PacketData::Connect(Some(payload)),
            ns: normalize(ns.into()),
        }
    }

    /// A client-initiated CONNECT, optionally carrying an auth payload.
    pub fn connect_request(ns: impl Into<Cow<'static, str>>, auth: Option<Value>) -> Self {
        Self {
            inner: PacketData::Connect(auth),
            ns: normalize(ns.into()),
        }
    }

    pub fn disconnect(ns: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns: normalize(ns.into()),
        }
    }

    /// An EVENT packet; promoted to BINARY_EVENT when any argument holds a
    /// binary leaf.
    pub fn event(
        ns: impl Into<Cow<'static, str>>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        let event = event.into();
        let inner = if args.iter().any(Value::has_binary) {
            PacketData::BinaryEvent(event, args, None)
        } else {
            PacketData::Event(event, args, None)
        };
        Self {
            inner,
            ns: normalize(ns.into()),
        }
    }

    /// An ACK packet; promoted to BINARY_ACK when any argument holds a
    /// binary leaf.
    pub fn ack(ns: impl Into<Cow<'static, str>>, args: Vec<Value>, id: i64) -> Self {
        let inner = if args.iter().any(Value::has_binary) {
            PacketData::BinaryAck(args, id)
        } else {
            PacketData::EventAck(args, id)
        };
        Self {
            inner,
            ns: normalize(ns.into()),
        }
    }

    pub fn connect_error(ns: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            inner: PacketData::ConnectError(message.into()),
            ns: normalize(ns.into()),
        }
    }

    pub fn invalid_namespace(ns: impl Into<Cow<'static, str>>) -> Self {
        Self::connect_error(ns, "Invalid namespace")
    }
}

fn normalize(ns: Cow<'static, str>) -> Cow<'static, str> {
    if ns.starts_with('/') {
        ns
    } else {
        Cow::Owned(format!("/{ns}"))
    }
}

impl PacketData {
    pub(crate) fn index(&self) -> u8 {
        match self {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_, _, _) => 2,
            PacketData::EventAck(_, _) => 3,
            PacketData::ConnectError(_) => 4,
            PacketData::BinaryEvent(_, _, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        }
    }

    /// Set the acknowledgement id on packets that carry one.
    pub(crate) fn set_ack_id(&mut self, ack_id: i64) {
        if let PacketData::Event(_, _, ack) | PacketData::BinaryEvent(_, _, ack) = self {
            *ack = Some(ack_id);
        }
    }

    pub(crate) fn ack_id(&self) -> Option<i64> {
        match self {
            PacketData::Event(_, _, ack) | PacketData::BinaryEvent(_, _, ack) => *ack,
            PacketData::EventAck(_, id) | PacketData::BinaryAck(_, id) => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        matches!(
            self,
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _)
        )
    }

    /// The number of binary leaves carried by the arguments.
    pub(crate) fn attachment_count(&self) -> usize {
        match self {
            PacketData::BinaryEvent(_, args, _) | PacketData::BinaryAck(args, _) => {
                args.iter().map(Value::binary_count).sum()
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn event_promotes_to_binary() {
        let packet = Packet::event("/", "upload", vec![Value::from(Bytes::from_static(&[1]))]);
        assert!(matches!(packet.inner, PacketData::BinaryEvent(_, _, None)));
        assert_eq!(packet.inner.attachment_count(), 1);

        let packet = Packet::event("/", "note", vec![Value::from("plain")]);
        assert!(matches!(packet.inner, PacketData::Event(_, _, None)));
    }

    #[test]
    fn ack_promotes_to_binary() {
        let packet = Packet::ack("/", vec![Value::from(vec![1u8, 2])], 3);
        assert!(matches!(packet.inner, PacketData::BinaryAck(_, 3)));

        let packet = Packet::ack("/", vec![Value::from("done")], 3);
        assert!(matches!(packet.inner, PacketData::EventAck(_, 3)));
    }

    #[test]
    fn namespace_is_normalized() {
        assert_eq!(Packet::disconnect("chat").ns, "/chat");
        assert_eq!(Packet::disconnect("/chat").ns, "/chat");
    }

    #[test]
    fn ack_id_is_only_set_on_events() {
        let mut packet = Packet::event("/", "e", vec![]);
        packet.inner.set_ack_id(7);
        assert_eq!(packet.inner.ack_id(), Some(7));

        let mut packet = Packet::disconnect("/");
        packet.inner.set_ack_id(7);
        assert_eq!(packet.inner.ack_id(), None);
    }
}
