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

//! Terminal device access.
//!
//! POSIX termios via libc. Only `ICANON` and `ECHO` are ever toggled; every
//! other setting captured from the terminal is carried through untouched.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::config::DeviceSource;
use crate::error::{KbdError, KbdResult};
use crate::signals;

/// The two line-discipline flags the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Line-buffered input (`ICANON`). Off means character-at-a-time.
    pub canonical: bool,
    /// Typed characters are reflected to the display (`ECHO`).
    pub echo: bool,
}

impl Mode {
    /// The usual shell state.
    pub const COOKED: Mode = Mode { canonical: true, echo: true };
    /// Character-at-a-time with nothing echoed.
    pub const RAW: Mode = Mode { canonical: false, echo: false };

    #[must_use]
    pub fn with_canonical(self, canonical: bool) -> Mode {
        Mode { canonical, ..self }
    }

    #[must_use]
    pub fn with_echo(self, echo: bool) -> Mode {
        Mode { echo, ..self }
    }

    pub(crate) fn to_bits(self) -> u8 {
        u8::from(self.canonical) | (u8::from(self.echo) << 1)
    }

    pub(crate) fn from_bits(bits: u8) -> Mode {
        Mode {
            canonical: bits & 0b01 != 0,
            echo: bits & 0b10 != 0,
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::COOKED
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let canonical = if self.canonical { "canonical" } else { "raw" };
        let echo = if self.echo { "echo" } else { "noecho" };
        write!(f, "{}+{}", canonical, echo)
    }
}

/// The OS boundary: discipline attributes plus single-byte reads.
///
/// `TtyDevice` is the real implementation; [`ScriptedDevice`](crate::scripted::ScriptedDevice)
/// stands in for it in tests.
pub trait TerminalDevice: Send + Sync + 'static {
    /// Opaque snapshot of the device's discipline settings.
    type Attributes: Clone + Send + Sync + 'static;

    fn attributes(&self) -> io::Result<Self::Attributes>;

    /// Push `attrs` to the device. `flush` discards pending input first.
    fn set_attributes(&self, attrs: &Self::Attributes, flush: bool) -> io::Result<()>;

    fn mode_of(attrs: &Self::Attributes) -> Mode;

    /// `attrs` with the canonical/echo flags replaced by `mode`.
    fn with_mode(attrs: &Self::Attributes, mode: Mode) -> Self::Attributes;

    /// Block until one byte arrives. EOF is `UnexpectedEof`.
    fn read_byte(&self) -> io::Result<u8>;

    /// Hand the original attributes to the process teardown hooks.
    fn arm_teardown(&self, _original: &Self::Attributes) {}

    /// Called once the original attributes are back in place.
    fn disarm_teardown(&self) {}

    /// Whether a teardown hook put the original attributes back behind the
    /// engine's back since the device was armed.
    fn external_restore_pending(&self) -> bool {
        false
    }

    /// Like [`external_restore_pending`](Self::external_restore_pending),
    /// clearing the indication.
    fn take_external_restore(&self) -> bool {
        false
    }
}

/// A real terminal driven through termios.
pub struct TtyDevice {
    fd: RawFd,
    // Keeps `/dev/tty` open for as long as the device lives.
    _tty: Option<File>,
}

impl TtyDevice {
    pub fn open(source: DeviceSource) -> KbdResult<TtyDevice> {
        let tty = match source {
            DeviceSource::Stdin => None,
            DeviceSource::ControllingTty => Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/dev/tty")
                    .map_err(|e| KbdError::DeviceUnavailable(format!("/dev/tty: {}", e)))?,
            ),
        };
        let fd = tty.as_ref().map_or(libc::STDIN_FILENO, AsRawFd::as_raw_fd);

        if unsafe { libc::isatty(fd) } != 1 {
            return Err(KbdError::DeviceUnavailable(format!(
                "fd {} is not a terminal",
                fd
            )));
        }
        Ok(TtyDevice { fd, _tty: tty })
    }
}

impl AsRawFd for TtyDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl TerminalDevice for TtyDevice {
    type Attributes = libc::termios;

    fn attributes(&self) -> io::Result<libc::termios> {
        unsafe {
            let mut attrs: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut attrs) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(attrs)
        }
    }

    fn set_attributes(&self, attrs: &libc::termios, flush: bool) -> io::Result<()> {
        // TCSAFLUSH drops queued input, TCSANOW leaves it for the next reader.
        let action = if flush { libc::TCSAFLUSH } else { libc::TCSANOW };
        if unsafe { libc::tcsetattr(self.fd, action, attrs) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn mode_of(attrs: &libc::termios) -> Mode {
        Mode {
            canonical: attrs.c_lflag & libc::ICANON != 0,
            echo: attrs.c_lflag & libc::ECHO != 0,
        }
    }

    fn with_mode(attrs: &libc::termios, mode: Mode) -> libc::termios {
        let mut next = *attrs;
        if mode.canonical {
            next.c_lflag |= libc::ICANON;
        } else {
            next.c_lflag &= !libc::ICANON;
            // Read one character at a time, no timeout
            next.c_cc[libc::VMIN] = 1;
            next.c_cc[libc::VTIME] = 0;
        }
        if mode.echo {
            next.c_lflag |= libc::ECHO;
        } else {
            next.c_lflag &= !libc::ECHO;
        }
        next
    }

    fn read_byte(&self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast::<libc::c_void>(), 1) };
        if n == 1 {
            return Ok(buf[0]);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
        }
        Err(io::Error::last_os_error())
    }

    fn arm_teardown(&self, original: &libc::termios) {
        signals::arm(self.fd, *original);
    }

    fn disarm_teardown(&self) {
        signals::disarm();
    }

    fn external_restore_pending(&self) -> bool {
        signals::restored_by_hook()
    }

    fn take_external_restore(&self) -> bool {
        signals::take_restored_by_hook()
    }
}
