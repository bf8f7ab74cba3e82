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

//! Owned message buffers.
//!
//! A [`Message`] owns its bytes and the allocator they came from. Moving it into
//! [`Connection::send_message`](crate::Connection::send_message) hands the buffer to the
//! engine, which releases it after the last byte hit the socket; dropping it anywhere
//! else releases it right away. There is no way to free a message twice or to touch it
//! after the engine took it.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;

use crate::{NetError, NetResult};

pub use allocator::{HeapAllocator, MessageAllocator};

mod allocator;

pub struct Message {
    buf: BytesMut,
    allocator: Arc<dyn MessageAllocator>,
}

impl Message {
    /// Allocates a zeroed message of `length` bytes.
    pub fn new(length: u32, allocator: &Arc<dyn MessageAllocator>) -> NetResult<Message> {
        if length == 0 {
            return Err(NetError::InvalidParam(
                "message length must be greater than 0".to_string(),
            ));
        }
        let buf = allocator.allocate(length as usize)?;
        Ok(Message {
            buf,
            allocator: allocator.clone(),
        })
    }

    /// Allocates a message holding a copy of `data`.
    pub fn copy_from(data: &[u8], allocator: &Arc<dyn MessageAllocator>) -> NetResult<Message> {
        let length = u32::try_from(data.len()).map_err(|_| {
            NetError::InvalidParam(format!("message of {} bytes is too large", data.len()))
        })?;
        let mut message = Message::new(length, allocator)?;
        message.buf.copy_from_slice(data);
        Ok(message)
    }

    /// Length as carried on the wire.
    pub fn length(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("length", &self.buf.len())
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        self.allocator.release(buf);
    }
}
