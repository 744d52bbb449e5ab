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

//! Canonical/echo state machine.
//!
//! Four states, any flag settable independently. The live mode is kept in an
//! atomic so readers never take the device lock; it is only published after
//! the device accepted the change.

use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;

use crate::error::KbdResult;
use crate::handle::TerminalHandle;
use crate::term::{Mode, TerminalDevice};

pub(crate) struct ModeController {
    published: AtomicU8,
}

impl ModeController {
    pub fn new(initial: Mode) -> Self {
        ModeController {
            published: AtomicU8::new(initial.to_bits()),
        }
    }

    pub fn mode(&self) -> Mode {
        Mode::from_bits(self.published.load(Ordering::Acquire))
    }

    pub fn publish(&self, mode: Mode) {
        self.published.store(mode.to_bits(), Ordering::Release);
    }

    /// Returns the previous canonical flag.
    pub fn set_canonical<D: TerminalDevice>(
        &self,
        handle: &mut TerminalHandle<D>,
        enabled: bool,
    ) -> KbdResult<bool> {
        let previous = handle.current_mode();
        self.set_mode(handle, previous.with_canonical(enabled))?;
        Ok(previous.canonical)
    }

    /// Returns the previous echo flag.
    pub fn set_echo<D: TerminalDevice>(
        &self,
        handle: &mut TerminalHandle<D>,
        enabled: bool,
    ) -> KbdResult<bool> {
        let previous = handle.current_mode();
        self.set_mode(handle, previous.with_echo(enabled))?;
        Ok(previous.echo)
    }

    /// Move to `target`, touching the device only if something changes.
    /// Returns the mode that was in effect before.
    pub fn set_mode<D: TerminalDevice>(
        &self,
        handle: &mut TerminalHandle<D>,
        target: Mode,
    ) -> KbdResult<Mode> {
        let previous = handle.current_mode();
        if previous == target {
            return Ok(previous);
        }
        handle.apply_mode(target)?;
        self.publish(handle.current_mode());
        debug!("terminal mode {} -> {}", previous, target);
        Ok(previous)
    }
}
