use std::{fmt, str::FromStr};

/// The transport a session is currently bound to.
///
/// Sessions open on either transport and may upgrade from polling to
/// websocket; the reverse never happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// HTTP long-polling: reads are GET requests that park until a packet
    /// is buffered, writes are POST requests carrying a packet payload.
    Polling = 0b01,
    /// A full-duplex websocket connection, one packet per frame.
    Websocket = 0b10,
}

impl TransportType {
    /// The transport name as it appears in the `transport` query parameter
    /// and in the handshake `upgrades` list.
    pub fn name(&self) -> &'static str {
        match self {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        }
    }
}

impl FromStr for TransportType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transport() {
        assert_eq!("polling".parse(), Ok(TransportType::Polling));
        assert_eq!("websocket".parse(), Ok(TransportType::Websocket));
        assert_eq!("carrier-pigeon".parse::<TransportType>(), Err(()));
    }
}
