//! Broadcast operators: select a set of sockets in a namespace, then emit.
//!
//! Membership is snapshotted when `emit` is called: a socket leaving
//! mid-broadcast may still receive the packet, a socket joining will not.

use std::collections::HashSet;
use std::sync::Arc;

use enginemux::Sid;
use serde::Serialize;

use crate::{
    errors::BroadcastError,
    ns::Namespace,
    packet::Packet,
    rooms::{Room, RoomParam},
    socket::Socket,
    value,
};

/// A pending broadcast, built fluently from a socket or the server façade.
pub struct Broadcast {
    ns: Arc<Namespace>,
    /// The emitting socket, excluded from room targets unless `within` was
    /// used. Server-initiated broadcasts have no sender.
    sender: Option<Sid>,
    include_sender: bool,
    rooms: Vec<Room>,
    except: Vec<Room>,
    all: bool,
}

impl Broadcast {
    pub(crate) fn from_socket(ns: Arc<Namespace>, sender: Sid) -> Self {
        Self {
            ns,
            sender: Some(sender),
            include_sender: false,
            rooms: Vec::new(),
            except: Vec::new(),
            all: false,
        }
    }

    pub(crate) fn from_server(ns: Arc<Namespace>) -> Self {
        Self {
            ns,
            sender: None,
            include_sender: true,
            rooms: Vec::new(),
            except: Vec::new(),
            all: true,
        }
    }

    /// Add target rooms; the sender stays excluded.
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Add target rooms, including the sender if it is a member.
    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.include_sender = true;
        self.rooms.extend(rooms.into_room_iter());
        self
    }

    /// Exclude the members of the given rooms.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.except.extend(rooms.into_room_iter());
        self
    }

    /// Target the whole namespace instead of specific rooms.
    pub fn broadcast(mut self) -> Self {
        self.all = true;
        self
    }

    /// Emit the event to every selected socket.
    ///
    /// Delivery uses the non-suspending send path so one saturated peer
    /// cannot stall the rest; per-socket failures are collected into the
    /// returned error.
    pub fn emit<T: Serialize>(
        self,
        event: impl Into<String>,
        data: T,
    ) -> Result<(), BroadcastError> {
        let args = value::to_args(data)?;
        let packet = Packet::event(self.ns.path.clone(), event.into(), args);

        let targets = self.targets();
        tracing::debug!(
            "[ns={}] broadcasting to {} sockets",
            self.ns.path,
            targets.len()
        );
        let errors: Vec<_> = targets
            .into_iter()
            .filter_map(|socket| socket.try_send_packet(packet.clone()).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BroadcastError::Send(errors))
        }
    }

    /// Resolve the operator chain to a concrete socket set, snapshotting
    /// room membership.
    fn targets(&self) -> Vec<Arc<Socket>> {
        let excluded = self.ns.rooms.members_of(&self.except);
        let skip = |sid: Sid| {
            excluded.contains(&sid)
                || (!self.include_sender && self.sender == Some(sid))
        };

        if !self.rooms.is_empty() {
            let members: HashSet<Sid> = self.ns.rooms.members_of(&self.rooms);
            members
                .into_iter()
                .filter(|sid| !skip(*sid))
                .filter_map(|sid| self.ns.get_socket(sid))
                .collect()
        } else if self.all {
            self.ns
                .sockets()
                .into_iter()
                .filter(|socket| !skip(socket.id))
                .collect()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::test::new_dummy;
    use crate::value::Value;
    use enginemux::Packet as EnginePacket;

    async fn message(
        esession: &Arc<enginemux::Session<crate::routing::SessionData>>,
    ) -> Option<String> {
        esession.dummy_recv().await.and_then(|p| match p {
            EnginePacket::Message(msg) => Some(msg),
            _ => None,
        })
    }

    #[tokio::test]
    async fn room_broadcast_excludes_sender() {
        let ns = Namespace::new("/".into());
        let (a, rx_a) = new_dummy(ns.clone());
        let (b, rx_b) = new_dummy(ns.clone());
        let (c, rx_c) = new_dummy(ns.clone());
        for socket in [&a, &b, &c] {
            socket.join("r");
        }

        a.to("r").emit("msg", "hello").unwrap();

        assert_eq!(message(&rx_b).await.unwrap(), r#"2["msg","hello"]"#);
        assert_eq!(message(&rx_c).await.unwrap(), r#"2["msg","hello"]"#);
        assert!(message(&rx_a).await.is_none());
    }

    #[tokio::test]
    async fn within_includes_sender() {
        let ns = Namespace::new("/".into());
        let (a, rx_a) = new_dummy(ns.clone());
        a.join("r");

        a.within("r").emit("msg", Value::Null).unwrap();
        assert_eq!(message(&rx_a).await.unwrap(), r#"2["msg",null]"#);
    }

    #[tokio::test]
    async fn except_filters_rooms() {
        let ns = Namespace::new("/".into());
        let (a, _rx_a) = new_dummy(ns.clone());
        let (b, rx_b) = new_dummy(ns.clone());
        let (c, rx_c) = new_dummy(ns.clone());
        b.join(["r"]);
        c.join(["r", "quiet"]);

        a.to("r").except("quiet").emit("msg", "hi").unwrap();
        assert_eq!(message(&rx_b).await.unwrap(), r#"2["msg","hi"]"#);
        assert!(message(&rx_c).await.is_none());
    }

    #[tokio::test]
    async fn namespace_broadcast_reaches_everyone() {
        let ns = Namespace::new("/".into());
        let (_a, rx_a) = new_dummy(ns.clone());
        let (_b, rx_b) = new_dummy(ns.clone());

        Broadcast::from_server(ns.clone())
            .emit("news", "hello")
            .unwrap();
        assert_eq!(message(&rx_a).await.unwrap(), r#"2["news","hello"]"#);
        assert_eq!(message(&rx_b).await.unwrap(), r#"2["news","hello"]"#);
    }

    #[tokio::test]
    async fn socket_broadcast_excludes_self() {
        let ns = Namespace::new("/".into());
        let (a, rx_a) = new_dummy(ns.clone());
        let (_b, rx_b) = new_dummy(ns.clone());

        a.broadcast().emit("news", "hello").unwrap();
        assert!(message(&rx_a).await.is_none());
        assert_eq!(message(&rx_b).await.unwrap(), r#"2["news","hello"]"#);
    }
}
