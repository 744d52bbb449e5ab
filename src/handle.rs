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

//! The owned terminal: device plus original and live attributes.

use std::cell::Cell;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::config::RestoreAction;
use crate::error::{KbdError, KbdResult};
use crate::term::{Mode, TerminalDevice};

pub struct TerminalHandle<D: TerminalDevice> {
    device: Arc<D>,
    original: D::Attributes,
    current: D::Attributes,
    restore_action: RestoreAction,
    // A byte read ahead and handed back for the next read.
    pushback: Cell<Option<u8>>,
    // The last line ended on `\r`; a `\n` right after it belongs to it.
    after_cr: Cell<bool>,
}

impl<D: TerminalDevice> TerminalHandle<D> {
    /// Take ownership of `device` and snapshot its attributes.
    ///
    /// The snapshot is taken here and nowhere else; it is what
    /// [`restore`](Self::restore) puts back.
    pub fn acquire(device: D, restore_action: RestoreAction) -> KbdResult<Self> {
        let original = device
            .attributes()
            .map_err(|e| KbdError::DeviceUnavailable(e.to_string()))?;
        device.arm_teardown(&original);
        debug!("terminal acquired in {} mode", D::mode_of(&original));
        Ok(TerminalHandle {
            device: Arc::new(device),
            current: original.clone(),
            original,
            restore_action,
            pushback: Cell::new(None),
            after_cr: Cell::new(false),
        })
    }

    pub fn current_mode(&self) -> Mode {
        D::mode_of(&self.current)
    }

    /// Push `attrs` to the device now. `current` only changes on success.
    pub fn apply(&mut self, attrs: D::Attributes) -> KbdResult<()> {
        self.device
            .set_attributes(&attrs, false)
            .map_err(KbdError::AttributeApplyError)?;
        self.current = attrs;
        Ok(())
    }

    pub fn apply_mode(&mut self, mode: Mode) -> KbdResult<()> {
        let attrs = D::with_mode(&self.current, mode);
        self.apply(attrs)
    }

    /// Reapply the original attributes. Safe to call any number of times.
    pub fn restore(&mut self) -> KbdResult<()> {
        self.restorer().restore()?;
        self.current = self.original.clone();
        Ok(())
    }

    /// Record that the original attributes were put back out of band.
    pub(crate) fn mark_restored(&mut self) {
        self.current = self.original.clone();
    }

    /// A detached handle that can put the original attributes back without
    /// holding the lock around this handle (a read may be blocked in it).
    pub fn restorer(&self) -> Restorer<D> {
        Restorer {
            device: Arc::clone(&self.device),
            original: self.original.clone(),
            flush: self.restore_action.flushes(),
        }
    }

    pub fn read_raw_byte(&self) -> KbdResult<u8> {
        self.after_cr.set(false);
        if let Some(byte) = self.pushback.take() {
            return Ok(byte);
        }
        let byte = self.device.read_byte().map_err(KbdError::from_read)?;
        trace!("read byte {:#04x}", byte);
        Ok(byte)
    }

    /// Hand `byte` back; the next read returns it before touching the device.
    pub fn unread_byte(&self, byte: u8) {
        self.pushback.set(Some(byte));
    }

    /// Read up to (not including) the first byte in `terminators`.
    ///
    /// EOF before any byte is `DeviceClosed`; EOF after a partial line
    /// hands back what was read.
    ///
    /// A `\n` directly after a line that ended on `\r` is skipped, so CRLF
    /// input yields one line per pair.
    pub fn read_raw_line(&self, terminators: &[u8]) -> KbdResult<Vec<u8>> {
        let mut skip_lf = self.after_cr.get();
        let mut line = Vec::new();
        loop {
            match self.read_raw_byte() {
                Ok(b'\n') if skip_lf => skip_lf = false,
                Ok(b) if terminators.contains(&b) => {
                    self.after_cr.set(b == b'\r');
                    return Ok(line);
                }
                Ok(b) => {
                    skip_lf = false;
                    line.push(b);
                }
                Err(KbdError::DeviceClosed) if !line.is_empty() => {
                    debug!("device closed after {} bytes of an unterminated line", line.len());
                    return Ok(line);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct Restorer<D: TerminalDevice> {
    device: Arc<D>,
    original: D::Attributes,
    flush: bool,
}

impl<D: TerminalDevice> Restorer<D> {
    pub fn restore(&self) -> KbdResult<()> {
        self.device
            .set_attributes(&self.original, self.flush)
            .map_err(|e| {
                warn!("failed to restore terminal attributes: {}", e);
                KbdError::AttributeApplyError(e)
            })?;
        debug!("terminal restored to {} mode", D::mode_of(&self.original));
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        D::mode_of(&self.original)
    }

    /// Tell the process teardown hooks the terminal no longer needs them.
    pub fn disarm(&self) {
        self.device.disarm_teardown();
    }

    pub fn external_restore_pending(&self) -> bool {
        self.device.external_restore_pending()
    }

    pub fn take_external_restore(&self) -> bool {
        self.device.take_external_restore()
    }
}
