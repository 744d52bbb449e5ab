// Copyright 2026 Daniel Smith
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

//! Blocking key and line reads under the current mode.

use log::trace;
use regex::Regex;

use crate::error::{KbdError, KbdResult};
use crate::handle::TerminalHandle;
use crate::term::TerminalDevice;

/// Return and newline both end a line; with `ICRNL` off Enter arrives as `\r`.
const LINE_TERMINATORS: &[u8] = b"\n\r";

pub(crate) struct SyncReader<'a, D: TerminalDevice> {
    handle: &'a TerminalHandle<D>,
    key_filter: Option<&'a Regex>,
}

impl<'a, D: TerminalDevice> SyncReader<'a, D> {
    pub fn new(handle: &'a TerminalHandle<D>, key_filter: Option<&'a Regex>) -> Self {
        SyncReader { handle, key_filter }
    }

    /// Read one key.
    ///
    /// Canonical mode must already be off: in canonical mode the device
    /// holds everything back until Enter, so this fails with
    /// `KeyReadInCanonicalMode` instead of switching modes behind the
    /// caller's back.
    pub fn read_key(&self) -> KbdResult<char> {
        if self.handle.current_mode().canonical {
            return Err(KbdError::KeyReadInCanonicalMode);
        }
        loop {
            let ch = self.read_char()?;
            match self.key_filter {
                Some(re) if !re.is_match(ch.encode_utf8(&mut [0; 4])) => {
                    trace!("key {:?} rejected by filter", ch);
                }
                _ => return Ok(ch),
            }
        }
    }

    /// Read through the next Enter and return the text before it.
    pub fn read_line(&self) -> KbdResult<String> {
        let bytes = self.handle.read_raw_line(LINE_TERMINATORS)?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    /// One UTF-8 character, assembled from as many bytes as its lead byte
    /// announces. A sequence cut short by a non-continuation byte is U+FFFD
    /// and leaves that byte for the next read.
    fn read_char(&self) -> KbdResult<char> {
        let lead = self.handle.read_raw_byte()?;
        let width = utf8_width(lead);
        if width <= 1 {
            return Ok(if lead.is_ascii() {
                char::from(lead)
            } else {
                char::REPLACEMENT_CHARACTER
            });
        }
        let mut buf = [lead, 0, 0, 0];
        for slot in buf.iter_mut().take(width).skip(1) {
            let byte = self.handle.read_raw_byte()?;
            if byte & 0xC0 != 0x80 {
                // Truncated sequence; `byte` starts the next key.
                self.handle.unread_byte(byte);
                return Ok(char::REPLACEMENT_CHARACTER);
            }
            *slot = byte;
        }
        Ok(std::str::from_utf8(&buf[..width])
            .ok()
            .and_then(|s| s.chars().next())
            .unwrap_or(char::REPLACEMENT_CHARACTER))
    }
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        // Stray continuation or invalid lead byte.
        _ => 0,
    }
}
