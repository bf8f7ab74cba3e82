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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{NetError, NetResult};

pub const MAGIC: [u8; 4] = *b"LIDR";
/// magic(4) total(4) header_len(1) version(1) sequence(2) method(2) option_offset(1) flags(1)
pub const FIXED_HEADER_LEN: usize = 16;
pub const CURRENT_VERSION: u8 = Version::V1 as u8;

const SEQUENCE_OFFSET: usize = 10;
const METHOD_OFFSET: usize = 12;
const FLAGS_OFFSET: usize = 15;

/// Flag bit set on a heartbeat answer.
pub const FLAG_PONG: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1 = 1,
}

/// Operation codes of the storage service. The engine itself only looks at `Heartbeat`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Heartbeat = 0,

    Login = 1000,
    SignUp = 1001,
    QuerySignUp = 1002,
    ProcessSignUp = 1003,
    QuerySignUpResult = 1004,
    ModifyPassword = 1005,
    CreateTag = 1006,
    QueryTags = 1007,
    DeleteTag = 1008,
    UpdateUserTag = 1009,

    ReadDir = 2000,
    GetFileInfo = 2001,
    CreateDir = 2002,
    RemoveDir = 2003,
    Copy = 2004,
    Move = 2005,
    CreateFile = 2006,
    DeleteFile = 2007,
    OpenFile = 2008,

    ShareTo = 3000,
    UpdateShare = 3001,
    CancelShare = 3002,
    QueryShareMe = 3003,
    QueryShareTo = 3004,

    CreateZone = 4000,
    QueryZone = 4001,
    DeleteZone = 4002,
}

impl TryFrom<u16> for Method {
    type Error = NetError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let method = match value {
            0 => Method::Heartbeat,
            1000 => Method::Login,
            1001 => Method::SignUp,
            1002 => Method::QuerySignUp,
            1003 => Method::ProcessSignUp,
            1004 => Method::QuerySignUpResult,
            1005 => Method::ModifyPassword,
            1006 => Method::CreateTag,
            1007 => Method::QueryTags,
            1008 => Method::DeleteTag,
            1009 => Method::UpdateUserTag,
            2000 => Method::ReadDir,
            2001 => Method::GetFileInfo,
            2002 => Method::CreateDir,
            2003 => Method::RemoveDir,
            2004 => Method::Copy,
            2005 => Method::Move,
            2006 => Method::CreateFile,
            2007 => Method::DeleteFile,
            2008 => Method::OpenFile,
            3000 => Method::ShareTo,
            3001 => Method::UpdateShare,
            3002 => Method::CancelShare,
            3003 => Method::QueryShareMe,
            3004 => Method::QueryShareTo,
            4000 => Method::CreateZone,
            4001 => Method::QueryZone,
            4002 => Method::DeleteZone,
            invalid => {
                return Err(NetError::ProtocolViolation(format!(
                    "method:{} is invalid",
                    invalid
                )))
            }
        };
        Ok(method)
    }
}

impl From<Method> for u16 {
    fn from(value: Method) -> Self {
        value as u16
    }
}

/// Decoded fixed header plus the raw option bytes.
///
/// Multi-byte fields are big-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub total_length: u32,
    pub header_length: u8,
    pub version: u8,
    pub sequence: u16,
    pub method: u16,
    pub option_offset: u8,
    pub flags: u8,
    pub option: Bytes,
}

impl ProtocolHeader {
    /// Header without option bytes for a payload of `payload_len` bytes.
    pub fn new(method: Method, sequence: u16, payload_len: usize) -> NetResult<ProtocolHeader> {
        Self::with_option(method, sequence, Bytes::new(), payload_len)
    }

    pub fn with_option(
        method: Method,
        sequence: u16,
        option: Bytes,
        payload_len: usize,
    ) -> NetResult<ProtocolHeader> {
        let header_length = FIXED_HEADER_LEN + option.len();
        if header_length > u8::MAX as usize {
            return Err(NetError::InvalidParam(format!(
                "option of {} bytes does not fit the header",
                option.len()
            )));
        }
        let total_length = (header_length + payload_len) as u64;
        if total_length >= u32::MAX as u64 {
            return Err(NetError::InvalidParam(format!(
                "frame of {} bytes is too large",
                total_length
            )));
        }
        Ok(ProtocolHeader {
            total_length: total_length as u32,
            header_length: header_length as u8,
            version: CURRENT_VERSION,
            sequence,
            method: method.into(),
            option_offset: FIXED_HEADER_LEN as u8,
            flags: 0,
            option,
        })
    }

    /// Decodes and validates the header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> NetResult<ProtocolHeader> {
        if frame.len() < FIXED_HEADER_LEN {
            return Err(NetError::ProtocolViolation(format!(
                "header needs {} bytes, got {}",
                FIXED_HEADER_LEN,
                frame.len()
            )));
        }
        if frame[..4] != MAGIC {
            return Err(NetError::ProtocolViolation(format!(
                "bad magic {:?}",
                &frame[..4]
            )));
        }
        let mut buf = &frame[4..FIXED_HEADER_LEN];
        let total_length = buf.get_u32();
        let header_length = buf.get_u8();
        let version = buf.get_u8();
        let sequence = buf.get_u16();
        let method = buf.get_u16();
        let option_offset = buf.get_u8();
        let flags = buf.get_u8();

        check_lengths(total_length, header_length, option_offset)?;
        let option_end = (header_length as usize).min(frame.len());
        let option_begin = (option_offset as usize).min(option_end);
        Ok(ProtocolHeader {
            total_length,
            header_length,
            version,
            sequence,
            method,
            option_offset,
            flags,
            option: Bytes::copy_from_slice(&frame[option_begin..option_end]),
        })
    }

    pub fn method_kind(&self) -> Option<Method> {
        Method::try_from(self.method).ok()
    }

    pub fn payload_len(&self) -> usize {
        self.total_length as usize - self.header_length as usize
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.header_length as usize);
        dst.put_slice(&MAGIC);
        dst.put_u32(self.total_length);
        dst.put_u8(self.header_length);
        dst.put_u8(self.version);
        dst.put_u16(self.sequence);
        dst.put_u16(self.method);
        dst.put_u8(self.option_offset);
        dst.put_u8(self.flags);
        dst.put_slice(&self.option);
    }

    /// Header followed by `payload` in one contiguous buffer.
    pub fn encode_frame(&self, payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::with_capacity(self.total_length as usize);
        self.encode(&mut dst);
        dst.put_slice(payload);
        dst
    }
}

/// Field-level checks shared by the parser and the frame-length probe.
pub(crate) fn check_lengths(total_length: u32, header_length: u8, option_offset: u8) -> NetResult<()> {
    if total_length == 0 || total_length == u32::MAX {
        return Err(NetError::ProtocolViolation(format!(
            "total length {} out of range",
            total_length
        )));
    }
    if (header_length as usize) < FIXED_HEADER_LEN {
        return Err(NetError::ProtocolViolation(format!(
            "header length {} shorter than fixed header",
            header_length
        )));
    }
    if total_length < header_length as u32 {
        return Err(NetError::ProtocolViolation(format!(
            "total length {} shorter than header length {}",
            total_length, header_length
        )));
    }
    if option_offset > header_length {
        return Err(NetError::ProtocolViolation(format!(
            "option offset {} beyond header length {}",
            option_offset, header_length
        )));
    }
    Ok(())
}

/// Sequence of a frame that starts with a LIDR header, `None` for anything else.
pub fn peek_sequence(frame: &[u8]) -> Option<u16> {
    if frame.len() < FIXED_HEADER_LEN || frame[..4] != MAGIC {
        return None;
    }
    Some(u16::from_be_bytes([
        frame[SEQUENCE_OFFSET],
        frame[SEQUENCE_OFFSET + 1],
    ]))
}

pub fn write_sequence(frame: &mut [u8], sequence: u16) -> NetResult<()> {
    if frame.len() < FIXED_HEADER_LEN || frame[..4] != MAGIC {
        return Err(NetError::InvalidParam(
            "request does not start with a LIDR header".to_string(),
        ));
    }
    frame[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 2].copy_from_slice(&sequence.to_be_bytes());
    Ok(())
}

/// Header-only heartbeat frame.
pub fn heartbeat_frame(pong: bool) -> Bytes {
    let mut header = ProtocolHeader {
        total_length: FIXED_HEADER_LEN as u32,
        header_length: FIXED_HEADER_LEN as u8,
        version: CURRENT_VERSION,
        sequence: 0,
        method: Method::Heartbeat.into(),
        option_offset: FIXED_HEADER_LEN as u8,
        flags: 0,
        option: Bytes::new(),
    };
    if pong {
        header.flags |= FLAG_PONG;
    }
    header.encode_frame(&[]).freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Pong,
}

/// Recognizes a complete heartbeat frame.
pub fn heartbeat_kind(frame: &[u8]) -> Option<Heartbeat> {
    if frame.len() != FIXED_HEADER_LEN || frame[..4] != MAGIC {
        return None;
    }
    let method = u16::from_be_bytes([frame[METHOD_OFFSET], frame[METHOD_OFFSET + 1]]);
    if method != u16::from(Method::Heartbeat) {
        return None;
    }
    if frame[FLAGS_OFFSET] & FLAG_PONG != 0 {
        Some(Heartbeat::Pong)
    } else {
        Some(Heartbeat::Ping)
    }
}
