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

//! In-memory terminal for tests and headless hosts.
//!
//! Attributes are just a [`Mode`]. Input is fed from the outside and
//! consumed by blocking reads; bytes read while echo is on are recorded so
//! callers can see what would have reached the display.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::term::{Mode, TerminalDevice};

#[derive(Default)]
struct Script {
    attrs: Mode,
    ambient: Mode,
    external_restore: bool,
    input: VecDeque<u8>,
    echoed: Vec<u8>,
    applies: Vec<Mode>,
    closed: bool,
    detached: bool,
    reject_applies: bool,
    interrupt: bool,
    blocked_readers: usize,
}

struct Shared {
    script: Mutex<Script>,
    wake: Condvar,
}

/// Clones share the same terminal, so a test keeps one to script input while the
/// engine owns another.
#[derive(Clone)]
pub struct ScriptedDevice {
    shared: Arc<Shared>,
}

impl ScriptedDevice {
    pub fn new(initial: Mode) -> ScriptedDevice {
        ScriptedDevice {
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    attrs: initial,
                    ambient: initial,
                    ..Script::default()
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// A device whose attributes cannot be read, like a pipe on stdin.
    pub fn detached() -> ScriptedDevice {
        let device = ScriptedDevice::new(Mode::COOKED);
        device.lock().detached = true;
        device
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.shared.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes as if typed.
    pub fn feed(&self, bytes: &[u8]) {
        self.lock().input.extend(bytes);
        self.shared.wake.notify_all();
    }

    /// Hang up: reads fail with EOF once the queue drains.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.wake.notify_all();
    }

    /// Make the next blocked (or upcoming) read fail with `EINTR`.
    pub fn interrupt(&self) {
        self.lock().interrupt = true;
        self.shared.wake.notify_all();
    }

    /// Put the ambient attributes back the way a teardown hook would,
    /// without going through the engine.
    pub fn restore_externally(&self) {
        let mut script = self.lock();
        script.attrs = script.ambient;
        script.external_restore = true;
    }

    pub fn reject_applies(&self, reject: bool) {
        self.lock().reject_applies = reject;
    }

    /// Attributes as currently set on the device.
    pub fn attributes_now(&self) -> Mode {
        self.lock().attrs
    }

    /// Every successful attribute change, in order.
    pub fn applied(&self) -> Vec<Mode> {
        self.lock().applies.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.lock().applies.len()
    }

    /// Bytes consumed while echo was on.
    pub fn echoed(&self) -> Vec<u8> {
        self.lock().echoed.clone()
    }

    /// Number of reads currently waiting for input.
    pub fn blocked_readers(&self) -> usize {
        self.lock().blocked_readers
    }
}

impl TerminalDevice for ScriptedDevice {
    type Attributes = Mode;

    fn attributes(&self) -> io::Result<Mode> {
        let script = self.lock();
        if script.detached {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        Ok(script.attrs)
    }

    fn set_attributes(&self, attrs: &Mode, flush: bool) -> io::Result<()> {
        let mut script = self.lock();
        if script.reject_applies {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if flush {
            script.input.clear();
        }
        script.attrs = *attrs;
        script.applies.push(*attrs);
        Ok(())
    }

    fn mode_of(attrs: &Mode) -> Mode {
        *attrs
    }

    fn with_mode(_attrs: &Mode, mode: Mode) -> Mode {
        mode
    }

    fn read_byte(&self) -> io::Result<u8> {
        let mut script = self.lock();
        script.blocked_readers += 1;
        loop {
            if script.interrupt {
                script.interrupt = false;
                script.blocked_readers -= 1;
                return Err(io::Error::from_raw_os_error(libc::EINTR));
            }
            if let Some(b) = script.input.pop_front() {
                script.blocked_readers -= 1;
                if script.attrs.echo {
                    script.echoed.push(b);
                }
                return Ok(b);
            }
            if script.closed {
                script.blocked_readers -= 1;
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
            }
            script = self
                .shared
                .wake
                .wait(script)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn external_restore_pending(&self) -> bool {
        self.lock().external_restore
    }

    fn take_external_restore(&self) -> bool {
        std::mem::take(&mut self.lock().external_restore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reads_block_until_fed() {
        let device = ScriptedDevice::new(Mode::RAW);
        let reader = device.clone();
        let t = thread::spawn(move || reader.read_byte().unwrap());
        while device.blocked_readers() == 0 {
            thread::yield_now();
        }
        device.feed(b"x");
        assert_eq!(t.join().unwrap(), b'x');
    }

    #[test]
    fn echo_is_recorded_only_when_on() {
        let device = ScriptedDevice::new(Mode::COOKED);
        device.feed(b"ab");
        device.read_byte().unwrap();
        device.set_attributes(&Mode::COOKED.with_echo(false), false).unwrap();
        device.read_byte().unwrap();
        assert_eq!(device.echoed(), b"a");
    }

    #[test]
    fn flush_discards_queued_input() {
        let device = ScriptedDevice::new(Mode::RAW);
        device.feed(b"junk");
        device.set_attributes(&Mode::COOKED, true).unwrap();
        device.close();
        assert_eq!(device.read_byte().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
