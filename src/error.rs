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

//! Error type shared by every engine operation.

use std::io;

use thiserror::Error;

use crate::scheduler::ReadKind;
use crate::term::Mode;

/// Everything that can go wrong between the caller and the terminal device.
#[derive(Error, Debug)]
pub enum KbdError {
    /// No controlling terminal is attached (input redirected, `/dev/tty`
    /// missing, ...).
    #[error("no controlling terminal: {0}")]
    DeviceUnavailable(String),

    /// The device refused a discipline-flag change.
    #[error("terminal rejected attribute change: {0}")]
    AttributeApplyError(#[source] io::Error),

    /// A read hit end-of-file or a hung-up device.
    #[error("terminal device closed")]
    DeviceClosed,

    /// A read was aborted by a signal.
    #[error("terminal read interrupted by a signal")]
    Interrupted,

    /// Another read (of either kind) is already in flight.
    #[error("a {0} read is already pending")]
    RequestAlreadyPending(ReadKind),

    /// Only raised under [`ModeChangePolicy::FailFast`](crate::ModeChangePolicy::FailFast).
    #[error("cannot change terminal mode while a {0} read is pending")]
    ModeChangeWhileReadPending(ReadKind),

    /// Single-key capture needs canonical mode switched off first.
    #[error("single-key reads require canonical mode to be off")]
    KeyReadInCanonicalMode,

    /// A mode change accepted while a read was pending could not be applied
    /// once the read finished. The terminal stayed in its previous mode.
    #[error("deferred change to {target} mode failed: {source}")]
    DeferredModeChangeFailed {
        target: Mode,
        #[source]
        source: Box<KbdError>,
    },

    #[error("input engine has been shut down")]
    ShutDown,

    /// The completion side of an async read went away without a result.
    #[error("read worker dropped the request")]
    WorkerGone,

    #[error("terminal I/O error: {0}")]
    Io(#[from] io::Error),
}

impl KbdError {
    /// Map an error from a raw device read onto the engine's error kinds.
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::DeviceClosed,
            io::ErrorKind::Interrupted => Self::Interrupted,
            _ => match err.raw_os_error() {
                // A hung-up tty reports EIO; a closed descriptor EBADF.
                Some(libc::EIO | libc::EBADF) => Self::DeviceClosed,
                _ => Self::Io(err),
            },
        }
    }

    /// Whether this is ordinary caller-visible behaviour rather than a fault.
    ///
    /// Used to pick `warn` over `error` when logging.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::DeviceClosed
                | Self::Interrupted
                | Self::RequestAlreadyPending(_)
                | Self::ModeChangeWhileReadPending(_)
                | Self::KeyReadInCanonicalMode
                | Self::ShutDown
        )
    }

    /// Errors after which the device is unusable and the original
    /// attributes must be put back.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceClosed | Self::Io(_))
    }
}

pub type KbdResult<T> = std::result::Result<T, KbdError>;
