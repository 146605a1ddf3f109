//! Terminal echo and Ctrl+C handling
//!
//! Key presses meant for the emulator should not be echoed onto the
//! terminal. Echo is turned off for the lifetime of an [`EchoGuard`] and
//! turned back on when it drops, or from the SIGINT handler, which then lets
//! the default action terminate the process.

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

/// Controlling terminal whose echo the SIGINT handler restores, or -1
static TTY_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_echo(tty: &impl AsFd, enabled: bool) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(tty)?;
    attrs.local_flags.set(LocalFlags::ECHO, enabled);
    termios::tcsetattr(tty, SetArg::TCSANOW, &attrs)
}

/// Keeps terminal echo off while alive
#[derive(Debug)]
pub struct EchoGuard {
    tty: File,
}

impl EchoGuard {
    pub fn disable() -> io::Result<Self> {
        let tty = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
        set_echo(&tty, false)?;
        TTY_FD.store(tty.as_raw_fd(), Ordering::SeqCst);
        debug!("Terminal echo disabled");
        Ok(Self { tty })
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        TTY_FD.store(-1, Ordering::SeqCst);
        if let Err(e) = set_echo(&self.tty, true) {
            warn!("Could not restore terminal echo: {}", e);
        }
    }
}

extern "C" fn on_interrupt(_: libc::c_int) {
    let fd = TTY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: tcgetattr and tcsetattr are async-signal-safe and `attrs`
        // is a plain stack value.
        unsafe {
            let mut attrs: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut attrs) == 0 {
                attrs.c_lflag |= libc::ECHO;
                libc::tcsetattr(fd, libc::TCSANOW, &attrs);
            }
        }
    }

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restoring the default disposition installs no Rust code.
    let _ = unsafe { signal::sigaction(Signal::SIGINT, &default) };
    let _ = signal::raise(Signal::SIGINT);
}

/// Restore echo and terminate on Ctrl+C
pub fn install_interrupt_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic and async-signal-safe calls.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}
