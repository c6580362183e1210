//! Polling payload codec.
//!
//! A polling response body carries any number of packets, each prefixed by
//! its length in unicode characters as ASCII decimal digits and a `:`.

use crate::errors::Error;

pub const LENGTH_SEPARATOR: char = ':';

/// Concatenate encoded packets into a single polling body.
pub fn encode(packets: impl IntoIterator<Item = String>) -> String {
    let mut body = String::new();
    for packet in packets {
        body.push_str(&packet.chars().count().to_string());
        body.push(LENGTH_SEPARATOR);
        body.push_str(&packet);
    }
    body
}

/// Iterate over the packets of a polling body.
pub fn decode(body: &str) -> Decoder<'_> {
    Decoder { rest: body }
}

pub struct Decoder<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Decoder<'a> {
    type Item = Result<&'a str, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let sep = match self.rest.find(LENGTH_SEPARATOR) {
            Some(i) if i > 0 => i,
            _ => {
                self.rest = "";
                return Some(Err(Error::InvalidLengthPrefix));
            }
        };
        let len: usize = match self.rest[..sep].parse() {
            Ok(len) => len,
            Err(_) => {
                self.rest = "";
                return Some(Err(Error::InvalidLengthPrefix));
            }
        };
        let data = &self.rest[sep + 1..];
        // The length prefix counts characters, not bytes.
        let end = match data.char_indices().nth(len) {
            Some((i, _)) => i,
            None if data.chars().count() == len => data.len(),
            None => {
                self.rest = "";
                return Some(Err(Error::InvalidLengthPrefix));
            }
        };
        self.rest = &data[end..];
        Some(Ok(&data[..end]))
    }
}
