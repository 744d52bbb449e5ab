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

//! kbd - keyboard input straight from the terminal
//!
//! Puts the controlling terminal into raw or cooked mode, toggles echo, and
//! reads single keys or whole lines, either blocking the caller or on a
//! worker thread with the result delivered through a [`ReadTask`] or a
//! callback.
//!
//! ```no_run
//! use kbd::InputEngine;
//!
//! # fn main() -> kbd::KbdResult<()> {
//! let kbd = InputEngine::open()?;
//!
//! kbd.set_canonical(false)?;
//! let key = kbd.get_key_sync()?;
//! println!("you pressed {key:?}");
//!
//! kbd.set_canonical(true)?;
//! kbd.set_echo(false)?;
//! let secret = kbd.get_line()?.wait()?;
//! println!("{} characters", secret.chars().count());
//! # Ok(())
//! # }
//! ```
//!
//! The terminal is put back the way it was found when the engine is
//! dropped, when a read hits a dead device, and (with the default
//! configuration) on `SIGINT`, `SIGQUIT`, `SIGTERM`, `SIGHUP` and panics.

mod config;
mod engine;
mod error;
mod handle;
mod input;
mod mode;
mod scheduler;
pub mod scripted;
pub mod signals;
mod term;

pub use config::{DeviceSource, EngineConfig, ModeChangePolicy, RestoreAction};
pub use engine::InputEngine;
pub use error::{KbdError, KbdResult};
pub use scheduler::{PendingRead, ReadKind, ReadTask};
pub use term::{Mode, TerminalDevice, TtyDevice};
