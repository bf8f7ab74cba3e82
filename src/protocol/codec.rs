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

use super::header::{check_lengths, FIXED_HEADER_LEN, MAGIC};

/// Answer of a frame-length probe over the bytes buffered so far.
///
/// Converts to and from the `u32` wire convention used by non-Rust handlers:
/// `0` means more data is needed and `u32::MAX` means the stream is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    Incomplete,
    /// Full frame length, which may exceed what is buffered yet.
    Complete(u32),
    Violation,
}

impl From<u32> for FrameLength {
    fn from(value: u32) -> Self {
        match value {
            0 => FrameLength::Incomplete,
            u32::MAX => FrameLength::Violation,
            n => FrameLength::Complete(n),
        }
    }
}

impl From<FrameLength> for u32 {
    fn from(value: FrameLength) -> Self {
        match value {
            FrameLength::Incomplete => 0,
            FrameLength::Complete(n) => n,
            FrameLength::Violation => u32::MAX,
        }
    }
}

/// Default frame boundary detection for LIDR streams.
///
/// The magic is checked on whatever prefix is available, so garbage is rejected on the
/// first byte that cannot start a frame. Once the fixed header is buffered the frame
/// length is the declared `totalLength`.
pub fn probe_frame_length(data: &[u8]) -> FrameLength {
    let magic_len = data.len().min(MAGIC.len());
    if data[..magic_len] != MAGIC[..magic_len] {
        return FrameLength::Violation;
    }
    if data.len() < FIXED_HEADER_LEN {
        return FrameLength::Incomplete;
    }
    let total_length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let header_length = data[8];
    let option_offset = data[14];
    match check_lengths(total_length, header_length, option_offset) {
        Ok(()) => FrameLength::Complete(total_length),
        Err(_) => FrameLength::Violation,
    }
}
