// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;

use crate::network::socket;
use crate::{AppError, AppResult};

/// id(2) + sequence(2) + payload size(4)
pub const HEADER_SIZE: usize = 8;

/// Non-blocking read access to a descriptor.
///
/// Returns `ErrorKind::WouldBlock` when nothing is buffered and `Ok(0)` on
/// end of stream, the same contract as `TcpStream::try_read`.
pub trait TryRead {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl TryRead for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus<T> {
    Complete(T),
    WouldBlock,
}

/// Accumulate into `buf[*filled..]` until it is full.
///
/// `Ok(true)` once the buffer is complete, `Ok(false)` when the descriptor ran
/// dry first. Progress is kept in `filled` so the call can be repeated on the
/// next readiness notification.
pub(crate) fn fill<R: TryRead + ?Sized>(
    src: &R,
    buf: &mut [u8],
    filled: &mut usize,
) -> AppResult<bool> {
    while *filled < buf.len() {
        match src.try_read(&mut buf[*filled..]) {
            Ok(0) => return Err(AppError::ConnectionClosed),
            Ok(n) => *filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u16,
    pub sequence: u16,
    pub payload_size: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> MessageHeader {
        MessageHeader {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            payload_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub sequence: u16,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u16, sequence: u16, payload: impl Into<Bytes>) -> Message {
        Message {
            id,
            sequence,
            payload: payload.into(),
        }
    }

    /// Serialize header and payload into one buffer.
    ///
    /// Fails before anything is produced when the payload exceeds
    /// `max_payload_size`.
    pub fn encode(&self, max_payload_size: u32) -> AppResult<BytesMut> {
        let payload_size = u32::try_from(self.payload.len())
            .ok()
            .filter(|size| *size <= max_payload_size)
            .ok_or_else(|| {
                AppError::MessageTooLarge(format!(
                    "payload of {} bytes exceeds the {} byte limit",
                    self.payload.len(),
                    max_payload_size
                ))
            })?;
        let header = MessageHeader {
            id: self.id,
            sequence: self.sequence,
            payload_size,
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&header.encode());
        buf.put_slice(&self.payload);
        Ok(buf)
    }
}

/// Write a whole message, waiting for socket space as needed.
pub async fn write_message(
    stream: &TcpStream,
    message: &Message,
    max_payload_size: u32,
) -> AppResult<()> {
    let buf = message.encode(max_payload_size)?;
    socket::write_all(stream, &buf).await?;
    Ok(())
}

/// Incremental decoder for one framed stream.
///
/// Each call consumes what the descriptor has available and resumes where the
/// previous call stopped. The payload buffer is only allocated after the
/// header passed the size check.
#[derive(Debug)]
pub struct MessageReader {
    max_payload_size: u32,
    header_buf: [u8; HEADER_SIZE],
    header_filled: usize,
    header: Option<MessageHeader>,
    payload: BytesMut,
    payload_filled: usize,
}

impl MessageReader {
    pub fn new(max_payload_size: u32) -> MessageReader {
        MessageReader {
            max_payload_size,
            header_buf: [0u8; HEADER_SIZE],
            header_filled: 0,
            header: None,
            payload: BytesMut::new(),
            payload_filled: 0,
        }
    }

    /// Bytes of the current message accumulated so far.
    pub fn buffered(&self) -> usize {
        self.header_filled + self.payload_filled
    }

    pub fn read<R: TryRead + ?Sized>(&mut self, src: &R) -> AppResult<ReadStatus<Message>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if !fill(src, &mut self.header_buf, &mut self.header_filled)? {
                    return Ok(ReadStatus::WouldBlock);
                }
                let header = MessageHeader::decode(&self.header_buf);
                if header.payload_size > self.max_payload_size {
                    return Err(AppError::MessageTooLarge(format!(
                        "peer announced {} payload bytes, limit is {}",
                        header.payload_size, self.max_payload_size
                    )));
                }
                self.payload = BytesMut::zeroed(header.payload_size as usize);
                self.payload_filled = 0;
                self.header = Some(header);
                header
            }
        };

        if !fill(src, &mut self.payload[..], &mut self.payload_filled)? {
            return Ok(ReadStatus::WouldBlock);
        }

        self.header = None;
        self.header_filled = 0;
        self.payload_filled = 0;
        let payload = std::mem::take(&mut self.payload).freeze();
        Ok(ReadStatus::Complete(Message {
            id: header.id,
            sequence: header.sequence,
            payload,
        }))
    }
}
