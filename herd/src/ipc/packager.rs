/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Wire framing of the IPC bus
//!
//! A frame is one prefix byte, the payload and a terminating NUL:
//!
//! ```text
//! [ '@' | raw text                  ] 0x00   text without NUL, not serialized
//! [ '!' | postcard bytes            ] 0x00   serialized form without NUL
//! [ '0' | escaped postcard bytes    ] 0x00   NUL and backslash escaped
//! ```
//!
//! Frames carry no length; readers split the byte stream at NUL.

use crate::error::Error;
use crate::ids::WorkerId;
use crate::ipc::envelope::{Envelope, Message};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read};

/// Terminates every frame
pub const FRAME_TERMINATOR: u8 = 0;

/// Terminates the handshake `"<uid>!"`
pub const HANDSHAKE_TERMINATOR: u8 = b'!';

const PREFIX_RAW: u8 = b'@';
const PREFIX_SERIALIZED: u8 = b'!';
const PREFIX_ESCAPED: u8 = b'0';
const ESCAPE: u8 = b'\\';

/// Longest handshake we wait for: twenty digits of u64 plus the terminator
const MAX_HANDSHAKE_LEN: usize = 21;

/// Size of the chunks read from a stream
const READ_CHUNK: usize = 4096;

/// Default cap on one unterminated frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Values that can be put on the wire
///
/// Text values can take the raw fast path and skip serialization.
pub trait Packable: Serialize + DeserializeOwned {
    fn as_text(&self) -> Option<&str> {
        None
    }

    fn from_text(_text: String) -> Option<Self> {
        None
    }
}

impl Packable for Message {
    fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }

    fn from_text(text: String) -> Option<Self> {
        Some(Message::Text(text))
    }
}

impl Packable for Envelope {}

/// Packs values into frame payloads and back
pub struct MessagePackager;

impl MessagePackager {
    /// Pack `value` into a payload without the terminator
    pub fn pack<T: Packable>(value: &T) -> Result<Vec<u8>, Error> {
        if let Some(text) = value.as_text()
            && !text.as_bytes().contains(&FRAME_TERMINATOR)
        {
            let mut payload = Vec::with_capacity(text.len() + 1);
            payload.push(PREFIX_RAW);
            payload.extend_from_slice(text.as_bytes());
            return Ok(payload);
        }

        let serialized = postcard::to_allocvec(value)?;
        if !serialized.contains(&FRAME_TERMINATOR) {
            let mut payload = Vec::with_capacity(serialized.len() + 1);
            payload.push(PREFIX_SERIALIZED);
            payload.extend_from_slice(&serialized);
            return Ok(payload);
        }

        let mut payload = Vec::with_capacity(serialized.len() * 2 + 1);
        payload.push(PREFIX_ESCAPED);
        escape_into(&serialized, &mut payload);
        Ok(payload)
    }

    /// Unpack a payload produced by [MessagePackager::pack]
    pub fn unpack<T: Packable>(payload: &[u8]) -> Result<T, Error> {
        match payload.split_first() {
            Some((&PREFIX_RAW, raw)) => {
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::Protocol("raw frame is not valid UTF-8"))?;
                T::from_text(text).ok_or(Error::Protocol("raw text frame for a non-text value"))
            },
            Some((&PREFIX_SERIALIZED, serialized)) => Ok(postcard::from_bytes(serialized)?),
            Some((&PREFIX_ESCAPED, escaped)) => Ok(postcard::from_bytes(&unescape(escaped)?)?),
            Some(_) => Err(Error::Protocol("unknown frame prefix")),
            None => Err(Error::Protocol("empty frame")),
        }
    }

    /// Pack `value` into a complete, terminated frame
    pub fn frame<T: Packable>(value: &T) -> Result<Vec<u8>, Error> {
        let mut frame = Self::pack(value)?;
        frame.push(FRAME_TERMINATOR);
        Ok(frame)
    }
}

fn escape_into(src: &[u8], dst: &mut Vec<u8>) {
    for &byte in src {
        match byte {
            FRAME_TERMINATOR => dst.extend_from_slice(&[ESCAPE, b'0']),
            ESCAPE => dst.extend_from_slice(&[ESCAPE, ESCAPE]),
            other => dst.push(other),
        }
    }
}

fn unescape(src: &[u8]) -> Result<Vec<u8>, Error> {
    let mut dst = Vec::with_capacity(src.len());
    let mut bytes = src.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            dst.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'0') => dst.push(FRAME_TERMINATOR),
            Some(&ESCAPE) => dst.push(ESCAPE),
            _ => return Err(Error::Protocol("invalid escape sequence")),
        }
    }
    Ok(dst)
}

/// Handshake a client writes right after connecting
pub fn handshake(uid: WorkerId) -> Vec<u8> {
    let mut bytes = uid.id().to_string().into_bytes();
    bytes.push(HANDSHAKE_TERMINATOR);
    bytes
}

/// Try to parse a handshake from the start of `src`
///
/// Returns the uid and the number of consumed bytes, `None` while incomplete.
pub fn parse_handshake(src: &[u8]) -> Result<Option<(WorkerId, usize)>, Error> {
    let Some(end) = src.iter().position(|b| *b == HANDSHAKE_TERMINATOR) else {
        if src.len() >= MAX_HANDSHAKE_LEN || src.iter().any(|b| !b.is_ascii_digit()) {
            return Err(Error::Protocol("malformed handshake"));
        }
        return Ok(None);
    };

    let digits = &src[..end];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol("malformed handshake"));
    }
    let uid: u64 = core::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Protocol("handshake uid out of range"))?;

    Ok(Some((WorkerId::new(uid), end + 1)))
}

/// Accumulates bytes from a stream and splits them into frames
pub struct FrameReader {
    buffer: Vec<u8>,
    /// Index at which the next unparsed byte starts
    begin: usize,
    max_frame: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }

    pub fn with_limit(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            begin: 0,
            max_frame,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Read everything `src` has to offer right now
    ///
    /// Stops at `WouldBlock`. End of stream is reported as `ConnectionReset` after the
    /// bytes read so far have been buffered.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match src.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::ConnectionReset.into()),
                Ok(n) => {
                    total += n;
                    self.feed(&chunk[..n]);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes received but not yet consumed
    pub fn unparsed(&self) -> &[u8] {
        &self.buffer[self.begin..]
    }

    /// Mark `count` unparsed bytes as consumed
    pub fn consume(&mut self, count: usize) {
        self.begin = (self.begin + count).min(self.buffer.len());
        self.compact();
    }

    /// Pop the next complete frame payload, without its terminator
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.unparsed().iter().position(|b| *b == FRAME_TERMINATOR) {
            Some(end) => {
                let frame = self.unparsed()[..end].to_vec();
                self.consume(end + 1);
                Ok(Some(frame))
            },
            None if self.unparsed().len() > self.max_frame => {
                Err(Error::Protocol("frame exceeds the maximum length"))
            },
            None => Ok(None),
        }
    }

    /// Move the unparsed bytes to the front once more than half the buffer is consumed
    fn compact(&mut self) {
        if self.begin == self.buffer.len() {
            self.buffer.clear();
            self.begin = 0;
        } else if self.begin > self.buffer.len() / 2 {
            self.buffer.drain(..self.begin);
            self.begin = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::envelope::{Audience, Command};
    use crate::worker::state::WorkerState;

    fn repack<T: Packable>(payload: &[u8]) -> Vec<u8> {
        MessagePackager::pack(&MessagePackager::unpack::<T>(payload).unwrap()).unwrap()
    }

    #[test]
    fn plain_text_takes_the_raw_path() {
        let payload = MessagePackager::pack(&Message::from("hello")).unwrap();
        assert_eq!(payload, b"@hello");
        assert_eq!(repack::<Message>(&payload), payload);
        assert_eq!(
            MessagePackager::unpack::<Message>(&payload).unwrap(),
            Message::from("hello")
        );
    }

    #[test]
    fn text_with_nul_is_serialized_and_escaped() {
        let message = Message::from("nul\0inside\\");
        let payload = MessagePackager::pack(&message).unwrap();
        assert_eq!(payload[0], b'0');
        assert!(!payload.contains(&FRAME_TERMINATOR));
        assert_eq!(repack::<Message>(&payload), payload);
        assert_eq!(MessagePackager::unpack::<Message>(&payload).unwrap(), message);
    }

    #[test]
    fn composite_values_round_trip() {
        let state = WorkerState::new(WorkerId::new(1234), "echo");
        let envelopes = [
            Envelope::new(WorkerId::new(7), Audience::Server, 0, state),
            Envelope::new(WorkerId::SERVER, Audience::Selected, 7, Command::Stop),
            Envelope::new(WorkerId::new(300), Audience::Amount, 2, Message::Bytes(vec![0, 1, 2, 92])),
        ];

        for envelope in envelopes {
            let payload = MessagePackager::pack(&envelope).unwrap();
            assert!(payload[0] == b'!' || payload[0] == b'0');
            assert!(!payload.contains(&FRAME_TERMINATOR));
            assert_eq!(repack::<Envelope>(&payload), payload);
            assert_eq!(MessagePackager::unpack::<Envelope>(&payload).unwrap(), envelope);
        }
    }

    #[test]
    fn serialized_payload_without_nul_is_not_escaped() {
        let envelope = Envelope::new(WorkerId::new(5), Audience::Any, 1, Message::Bytes(vec![9, 9]));
        let payload = MessagePackager::pack(&envelope).unwrap();
        assert_eq!(payload[0], b'!');
        assert_eq!(&payload[1..], postcard::to_allocvec(&envelope).unwrap().as_slice());
    }

    #[test]
    fn bad_payloads_are_protocol_errors() {
        assert!(matches!(MessagePackager::unpack::<Message>(b""), Err(Error::Protocol(_))));
        assert!(matches!(MessagePackager::unpack::<Message>(b"?abc"), Err(Error::Protocol(_))));
        assert!(matches!(MessagePackager::unpack::<Message>(b"0ab\\x"), Err(Error::Protocol(_))));
        assert!(matches!(MessagePackager::unpack::<Envelope>(b"@text"), Err(Error::Protocol(_))));
    }

    #[test]
    fn frames_are_split_at_nul() {
        let mut reader = FrameReader::new();
        reader.feed(b"@one\0@tw");
        assert_eq!(reader.next_frame().unwrap(), Some(b"@one".to_vec()));
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.feed(b"o\0\0");
        assert_eq!(reader.next_frame().unwrap(), Some(b"@two".to_vec()));
        assert_eq!(reader.next_frame().unwrap(), Some(Vec::new()));
        assert_eq!(reader.next_frame().unwrap(), None);
        assert!(reader.unparsed().is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut reader = FrameReader::with_limit(4);
        reader.feed(b"@abcdef");
        assert!(matches!(reader.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn read_from_stops_at_would_block() {
        struct Chunks(Vec<io::Result<Vec<u8>>>);

        impl Read for Chunks {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.remove(0) {
                    Ok(bytes) => {
                        buf[..bytes.len()].copy_from_slice(&bytes);
                        Ok(bytes.len())
                    },
                    Err(e) => Err(e),
                }
            }
        }

        let mut reader = FrameReader::new();
        let mut src = Chunks(vec![Ok(b"@a\0".to_vec()), Ok(b"@b".to_vec()), Err(io::ErrorKind::WouldBlock.into())]);
        assert_eq!(reader.read_from(&mut src).unwrap(), 5);
        assert_eq!(reader.next_frame().unwrap(), Some(b"@a".to_vec()));

        let mut src = Chunks(vec![Ok(b"\0".to_vec()), Ok(Vec::new())]);
        let err = reader.read_from(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(reader.next_frame().unwrap(), Some(b"@b".to_vec()));
    }

    #[test]
    fn handshake_round_trip() {
        let bytes = handshake(WorkerId::new(4711));
        assert_eq!(bytes, b"4711!");

        let mut stream = bytes.clone();
        stream.extend_from_slice(b"@next\0");
        assert_eq!(parse_handshake(&stream).unwrap(), Some((WorkerId::new(4711), 5)));
        assert_eq!(parse_handshake(b"47").unwrap(), None);
        assert!(parse_handshake(b"4x!").is_err());
        assert!(parse_handshake(b"!").is_err());
        assert!(parse_handshake(b"4x").is_err());
    }
}
