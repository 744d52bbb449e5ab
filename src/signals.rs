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


//! Process teardown hooks.
//!
//! Signal handlers and a panic hook that put the terminal back the way it
//! was found. The handlers cannot be handed the engine, so the original
//! termios lives in a write-once static and the descriptor it belongs to in
//! an atomic that every acquisition re-arms and a clean shutdown clears.
//!
//! The signal handlers only stay installed while a terminal is armed, and
//! they chain to whatever the host had installed before them.

use std::os::unix::io::RawFd;
use std::panic;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, Once, OnceLock, PoisonError};

use libc::c_int;
use log::{debug, warn};

static SAVED_TERMIOS: OnceLock<libc::termios> = OnceLock::new();
static SAVED_FD: AtomicI32 = AtomicI32::new(-1);
static HOOKS_WANTED: AtomicBool = AtomicBool::new(false);
static RESTORED_BY_HOOK: AtomicBool = AtomicBool::new(false);
static PANIC_HOOK: Once = Once::new();

const RESTORE_SIGNALS: [c_int; 4] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGHUP];

/// Host actions displaced by ours, `Some` while our handlers are installed.
static DISPLACED: Mutex<Option<[libc::sigaction; 4]>> = Mutex::new(None);
// Copies of the displaced handler and flags the signal handler can read
// without taking a lock.
static CHAINED_HANDLER: [AtomicUsize; 4] = [const { AtomicUsize::new(libc::SIG_DFL) }; 4];
static CHAINED_FLAGS: [AtomicI32; 4] = [const { AtomicI32::new(0) }; 4];

/// Point the hooks at `fd`. The first termios handed in is the one every
/// later restore uses.
pub(crate) fn arm(fd: RawFd, original: libc::termios) {
    if SAVED_TERMIOS.set(original).is_err() {
        debug!("termios snapshot already taken; re-arming on fd {}", fd);
    }
    RESTORED_BY_HOOK.store(false, Ordering::Release);
    SAVED_FD.store(fd, Ordering::Release);
    if HOOKS_WANTED.load(Ordering::Acquire) {
        install_signal_handlers();
    }
}

/// The terminal has been put back; the hooks have nothing left to do and
/// the host's signal handlers return.
pub(crate) fn disarm() {
    SAVED_FD.store(-1, Ordering::Release);
    RESTORED_BY_HOOK.store(false, Ordering::Release);
    uninstall_signal_handlers();
}

/// Install the panic hook, and the signal handlers whenever a terminal is
/// armed. Safe to call more than once.
pub fn install() {
    HOOKS_WANTED.store(true, Ordering::Release);
    PANIC_HOOK.call_once(|| {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            restore_saved();
            default_hook(info);
        }));
    });
    if SAVED_FD.load(Ordering::Acquire) >= 0 {
        install_signal_handlers();
    }
}

/// Reapply the saved termios if a terminal is armed. Returns whether the
/// terminal was actually put back.
///
/// Async-signal-safe: atomics and `tcsetattr` only.
pub fn restore_saved() -> bool {
    let fd = SAVED_FD.load(Ordering::Acquire);
    if fd < 0 {
        return false;
    }
    let Some(original) = SAVED_TERMIOS.get() else {
        return false;
    };
    let restored = unsafe { libc::tcsetattr(fd, libc::TCSANOW, original) } == 0;
    if restored {
        RESTORED_BY_HOOK.store(true, Ordering::Release);
    }
    restored
}

/// Whether a hook restored the terminal since it was last armed.
pub(crate) fn restored_by_hook() -> bool {
    RESTORED_BY_HOOK.load(Ordering::Acquire)
}

/// Like [`restored_by_hook`], clearing the indication.
pub(crate) fn take_restored_by_hook() -> bool {
    RESTORED_BY_HOOK.swap(false, Ordering::AcqRel)
}

fn install_signal_handlers() {
    let mut displaced = DISPLACED.lock().unwrap_or_else(PoisonError::into_inner);
    if displaced.is_some() {
        return;
    }
    let mut saved: [libc::sigaction; 4] = unsafe { std::mem::zeroed() };
    for (slot, &sig) in RESTORE_SIGNALS.iter().enumerate() {
        unsafe {
            // A failed query leaves the zeroed action, which is SIG_DFL.
            if libc::sigaction(sig, ptr::null(), &mut saved[slot]) != 0 {
                warn!("failed to query the handler for signal {}", sig);
            }
            CHAINED_HANDLER[slot].store(saved[slot].sa_sigaction, Ordering::Release);
            CHAINED_FLAGS[slot].store(saved[slot].sa_flags, Ordering::Release);

            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = signal_handler as libc::sighandler_t;
            sa.sa_flags = libc::SA_SIGINFO | (saved[slot].sa_flags & libc::SA_RESTART);
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
                warn!("failed to install the restore handler for signal {}", sig);
            }
        }
    }
    *displaced = Some(saved);
}

fn uninstall_signal_handlers() {
    let Some(saved) = DISPLACED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        return;
    };
    for (slot, &sig) in RESTORE_SIGNALS.iter().enumerate() {
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(sig, ptr::null(), &mut current);
            // A handler the host installed over ours stays.
            if current.sa_sigaction == signal_handler as libc::sighandler_t {
                libc::sigaction(sig, &saved[slot], ptr::null_mut());
            }
        }
    }
}

extern "C" fn signal_handler(sig: c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    restore_saved();
    let Some(slot) = RESTORE_SIGNALS.iter().position(|&s| s == sig) else {
        return;
    };
    let chained = CHAINED_HANDLER[slot].load(Ordering::Acquire);
    let flags = CHAINED_FLAGS[slot].load(Ordering::Acquire);
    unsafe {
        match chained {
            libc::SIG_DFL => {
                // Blocked while we run; the default action lands on return.
                libc::signal(sig, libc::SIG_DFL);
                libc::raise(sig);
            }
            libc::SIG_IGN => {}
            handler if flags & libc::SA_SIGINFO != 0 => {
                let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    std::mem::transmute(handler);
                handler(sig, info, context);
            }
            handler => {
                let handler: extern "C" fn(c_int) = std::mem::transmute(handler);
                handler(sig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    static HOST_SAW: AtomicI32 = AtomicI32::new(0);

    extern "C" fn host_handler(sig: c_int) {
        HOST_SAW.store(sig, Ordering::SeqCst);
    }

    /// Slave side of a fresh pseudo-terminal, plus its master.
    fn open_pty() -> (RawFd, RawFd) {
        unsafe {
            let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(master >= 0, "posix_openpt failed");
            assert_eq!(libc::grantpt(master), 0);
            assert_eq!(libc::unlockpt(master), 0);
            let mut name = [0 as libc::c_char; 128];
            assert_eq!(libc::ptsname_r(master, name.as_mut_ptr(), name.len()), 0);
            let path = CStr::from_ptr(name.as_ptr());
            let slave = libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
            assert!(slave >= 0, "opening the pty slave failed");
            (master, slave)
        }
    }

    fn termios_of(fd: RawFd) -> libc::termios {
        unsafe {
            let mut t: libc::termios = std::mem::zeroed();
            assert_eq!(libc::tcgetattr(fd, &mut t), 0);
            t
        }
    }

    fn handler_for(sig: c_int) -> libc::sighandler_t {
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(sig, ptr::null(), &mut current);
            current.sa_sigaction
        }
    }

    // The hooks are process globals, so their whole lifecycle is one test.
    #[test]
    fn hooks_follow_the_armed_terminal_and_chain_to_the_host() {
        unsafe {
            libc::signal(libc::SIGHUP, host_handler as extern "C" fn(c_int) as libc::sighandler_t);
        }
        assert!(!restore_saved(), "nothing armed yet");

        let (first_master, first) = open_pty();
        let original = termios_of(first);
        install();
        install();
        arm(first, original);
        assert_eq!(handler_for(libc::SIGHUP), signal_handler as libc::sighandler_t);

        // A second terminal replaces the first; restores follow it.
        let (second_master, second) = open_pty();
        arm(second, termios_of(second));
        unsafe {
            libc::close(first);
            libc::close(first_master);
        }
        assert_eq!(SAVED_FD.load(Ordering::Acquire), second);

        let mut raw = termios_of(second);
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        unsafe { libc::tcsetattr(second, libc::TCSANOW, &raw) };
        assert!(restore_saved());
        assert!(take_restored_by_hook());
        assert_ne!(termios_of(second).c_lflag & libc::ICANON, 0);

        // The host's handler still sees the signal.
        unsafe { libc::raise(libc::SIGHUP) };
        assert_eq!(HOST_SAW.load(Ordering::SeqCst), libc::SIGHUP);

        disarm();
        assert_eq!(SAVED_FD.load(Ordering::Acquire), -1);
        assert!(!restore_saved());
        assert_eq!(
            handler_for(libc::SIGHUP),
            host_handler as extern "C" fn(c_int) as libc::sighandler_t
        );
        unsafe {
            libc::close(second);
            libc::close(second_master);
            libc::signal(libc::SIGHUP, libc::SIG_DFL);
        }
    }
}
