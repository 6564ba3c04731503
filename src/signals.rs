// src/signals.rs

//! Signal-delivery boundary.
//!
//! The OS calls [`on_signal`] in signal context. That handler only records
//! the signal number in an atomic bitmask and writes one byte to a
//! non-blocking self-pipe; the loop side ([`SignalReceiver`]) wakes up on the
//! pipe and hands the signal numbers to the arbiter, where logging and real
//! decisions happen.
//!
//! If the hand-off itself fails, the handler falls back to a raw `write(2)`
//! of a fixed message to stderr followed by `_exit(1)`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

/// Written to stderr when a signal cannot be passed to the loop.
pub const FATAL_HANDOFF_MESSAGE: &[u8] = b"CRITICAL: Signal handler failed to transfer control\n";

/// Signals the supervisor reacts to.
pub const HANDLED_SIGNALS: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGWINCH,
];

const ARMED: u8 = 0;
const DISPATCHING: u8 = 1;
const DEFERRED_PENDING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for a signal.
    Armed,
    /// Inside the OS-invoked handler.
    Dispatching,
    /// Handed to the loop, not yet drained.
    DeferredPending,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    #[error("no wake-up pipe is armed")]
    NotArmed,

    #[error("signal {0} cannot be queued")]
    OutOfRange(i32),

    #[error("wake-up write failed (errno {0})")]
    WriteFailed(i32),
}

/// Loop scheduling primitive callable from signal context.
///
/// Implementations may only use async-signal-safe operations.
pub trait SignalScheduler {
    fn schedule_from_signal(&self, signum: i32) -> Result<(), HandoffError>;
}

/// What signal context may still do after a failed hand-off.
pub trait FatalPath {
    fn write_stderr(&self, msg: &[u8]);
    fn exit_now(&self, code: i32);
}

/// Body of the OS-level handler: hand off or die.
///
/// `errno` is restored before returning, so the interrupted code still
/// reads the error of its own last syscall.
pub fn dispatch_from_signal<S, F>(scheduler: &S, fatal: &F, signum: i32)
where
    S: SignalScheduler + ?Sized,
    F: FatalPath + ?Sized,
{
    let saved_errno = Errno::last_raw();
    if scheduler.schedule_from_signal(signum).is_err() {
        fatal.write_stderr(FATAL_HANDOFF_MESSAGE);
        fatal.exit_now(1);
    }
    Errno::set_raw(saved_errno);
}

/// Self-pipe plus pending-signal bitmask.
///
/// All state is atomic so the signal handler never takes a lock or
/// allocates.
#[derive(Debug)]
pub struct SelfPipe {
    wake_fd: AtomicI32,
    pending: AtomicU64,
    state: AtomicU8,
}

impl Default for SelfPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfPipe {
    pub const fn new() -> Self {
        Self {
            wake_fd: AtomicI32::new(-1),
            pending: AtomicU64::new(0),
            state: AtomicU8::new(ARMED),
        }
    }

    /// Create the wake-up pipe and return the loop-side receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&'static self) -> io::Result<SignalReceiver> {
        let (read, write) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let previous = self.wake_fd.swap(write.into_raw_fd(), Ordering::SeqCst);
        close_raw(previous);
        self.state.store(ARMED, Ordering::SeqCst);

        Ok(SignalReceiver {
            pipe: self,
            wake: AsyncFd::new(read)?,
        })
    }

    /// Close the write end; later signals fail the hand-off.
    pub fn disarm(&self) {
        let fd = self.wake_fd.swap(-1, Ordering::SeqCst);
        close_raw(fd);
    }

    pub fn is_armed(&self) -> bool {
        self.wake_fd.load(Ordering::SeqCst) >= 0
    }

    pub fn state(&self) -> DispatchState {
        match self.state.load(Ordering::SeqCst) {
            DISPATCHING => DispatchState::Dispatching,
            DEFERRED_PENDING => DispatchState::DeferredPending,
            _ => DispatchState::Armed,
        }
    }

    /// Drain the bitmask, lowest signal number first.
    pub fn take_pending(&self) -> Vec<i32> {
        let bits = self.pending.swap(0, Ordering::SeqCst);
        self.state.store(ARMED, Ordering::SeqCst);
        (1..64).filter(|sig| bits & (1u64 << sig) != 0).collect()
    }
}

fn close_raw(fd: i32) {
    if fd >= 0 {
        // SAFETY: the descriptor came from `into_raw_fd` and is closed once,
        // after being swapped out of the atomic.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

impl SignalScheduler for SelfPipe {
    fn schedule_from_signal(&self, signum: i32) -> Result<(), HandoffError> {
        self.state.store(DISPATCHING, Ordering::SeqCst);
        if !(1..64).contains(&signum) {
            return Err(HandoffError::OutOfRange(signum));
        }
        let fd = self.wake_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(HandoffError::NotArmed);
        }

        self.pending.fetch_or(1u64 << signum, Ordering::SeqCst);
        let byte = [signum as u8];
        loop {
            // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
            let written = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
            if written == 1 {
                break;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Pipe full: a wake-up is already queued and the bit is set.
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => break,
                code => return Err(HandoffError::WriteFailed(code.unwrap_or(-1))),
            }
        }
        self.state.store(DEFERRED_PENDING, Ordering::SeqCst);
        Ok(())
    }
}

/// Raw `write(2)` + `_exit(2)`; the only fallback usable in signal context.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFatalPath;

impl FatalPath for RawFatalPath {
    fn write_stderr(&self, msg: &[u8]) {
        // SAFETY: write(2) is async-signal-safe; the result is irrelevant on
        // the way out.
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        }
    }

    fn exit_now(&self, code: i32) {
        // SAFETY: _exit(2) is async-signal-safe and skips atexit handlers.
        unsafe { libc::_exit(code) }
    }
}

/// Loop side of the self-pipe.
#[derive(Debug)]
pub struct SignalReceiver {
    pipe: &'static SelfPipe,
    wake: AsyncFd<OwnedFd>,
}

impl SignalReceiver {
    /// Wait until at least one signal was handed off and return them all.
    pub async fn recv(&mut self) -> io::Result<Vec<i32>> {
        let mut buf = [0u8; 64];
        loop {
            let mut ready = self.wake.readable().await?;
            let read = ready.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_raw_fd(), &mut buf).map_err(io::Error::from)
            });
            match read {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "signal wake-up pipe closed",
                    ));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }

            let signals = self.pipe.take_pending();
            if !signals.is_empty() {
                return Ok(signals);
            }
        }
    }
}

/// Signal action decided in the deferred (loop-side) handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Quit,
    Reload,
    Ignore,
}

impl SignalAction {
    pub fn for_signal(signum: i32) -> Option<Self> {
        match Signal::try_from(signum).ok()? {
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT => Some(SignalAction::Quit),
            Signal::SIGHUP => Some(SignalAction::Reload),
            Signal::SIGWINCH => Some(SignalAction::Ignore),
            _ => None,
        }
    }
}

/// `SIGTERM`-style name for log lines.
pub fn signal_name(signum: i32) -> String {
    match Signal::try_from(signum) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signum}"),
    }
}

static DISPATCH_PIPE: SelfPipe = SelfPipe::new();

extern "C" fn on_signal(signum: libc::c_int) {
    dispatch_from_signal(&DISPATCH_PIPE, &RawFatalPath, signum);
}

/// Installed OS handlers for [`HANDLED_SIGNALS`].
///
/// Only one dispatcher should be installed per process.
#[derive(Debug)]
pub struct SignalDispatcher {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalDispatcher {
    /// Arm the self-pipe and install the handlers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install() -> io::Result<(Self, SignalReceiver)> {
        let receiver = DISPATCH_PIPE.arm()?;
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        let mut dispatcher = Self {
            previous: Vec::with_capacity(HANDLED_SIGNALS.len()),
        };
        for sig in HANDLED_SIGNALS {
            // SAFETY: `on_signal` only touches atomics and calls write(2)/_exit(2).
            match unsafe { sigaction(sig, &action) } {
                Ok(old) => dispatcher.previous.push((sig, old)),
                Err(e) => {
                    dispatcher.stop();
                    return Err(io::Error::from(e));
                }
            }
        }

        info!(signals = ?HANDLED_SIGNALS, "signal handlers installed");
        Ok((dispatcher, receiver))
    }

    /// Restore the handlers that were in place before [`Self::install`].
    pub fn stop(&mut self) {
        if !DISPATCH_PIPE.is_armed() && self.previous.is_empty() {
            return;
        }
        for (sig, old) in self.previous.drain(..) {
            // SAFETY: restoring a disposition previously returned by sigaction.
            if let Err(e) = unsafe { sigaction(sig, &old) } {
                warn!(signal = %sig, error = %e, "could not restore signal handler");
            }
        }
        DISPATCH_PIPE.disarm();
        debug!("signal handlers restored");
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
