//! Line framing for the uplink socket.
//!
//! IRC lines are at most 512 bytes including the terminator. Inbound frames
//! split on CR or LF (tolerating either or both); an over-long accumulation
//! is truncated at the limit rather than dropped, matching the wire rule
//! that peers must not depend on anything past the boundary.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::MAX_LINE;
use crate::error::ProtocolError;

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\r' || b == b'\n') else {
                // No terminator yet; clamp runaway buffers at the line limit.
                if src.len() > MAX_LINE {
                    let frame = src.split_to(MAX_LINE);
                    let line = String::from_utf8_lossy(&frame).into_owned();
                    return Ok(Some(line));
                }
                return Ok(None);
            };
            let frame = src.split_to(pos);
            // Consume the terminator (and a paired LF after CR).
            if !src.is_empty() {
                let first = src[0];
                let _ = src.split_to(1);
                if first == b'\r' && src.first() == Some(&b'\n') {
                    let _ = src.split_to(1);
                }
            }
            if frame.is_empty() {
                continue;
            }
            let mut line = String::from_utf8_lossy(&frame).into_owned();
            if line.len() > MAX_LINE - 2 {
                line.truncate(MAX_LINE - 2);
            }
            return Ok(Some(line));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut line = item;
        if line.len() > MAX_LINE - 2 {
            line.truncate(MAX_LINE - 2);
        }
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
