//! Control-plane pipe between a parent and a spawned child process.
//!
//! Two anonymous pipes, one per direction, carrying the line protocol from
//! `codec`. The four fd numbers are appended to the child's argv; the child
//! adopts its two ends and closes the parent duplicates. All reads are
//! non-blocking and driven by a periodic idle tick, so a pipe can never
//! stall a UI or host-control thread.

use crate::codec::{encode, Decoder, Message};
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Number of trailing argv entries used for the pipe handshake.
pub const PIPE_ARG_COUNT: usize = 4;

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(BridgeError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One side of a bidirectional control channel.
#[derive(Debug)]
pub struct ControlPipe {
    recv: File,
    send: File,
    decoder: Decoder,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ControlPipe {
    /// Spawn `command` with the four pipe fds appended to its argv and wait
    /// up to `handshake_timeout` for the child's first newline byte.
    ///
    /// On handshake failure the child is killed and reaped before returning.
    pub fn spawn(mut command: Command, handshake_timeout: Duration) -> Result<(Self, Child)> {
        // child-to-parent, then parent-to-child
        let (parent_read, child_write) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        let (child_read, parent_write) = nix::unistd::pipe().map_err(std::io::Error::from)?;

        set_nonblocking(&parent_read)?;

        command
            .arg(parent_read.as_raw_fd().to_string())
            .arg(parent_write.as_raw_fd().to_string())
            .arg(child_read.as_raw_fd().to_string())
            .arg(child_write.as_raw_fd().to_string());

        let mut child = command.spawn()?;

        // the child inherited these; parent must not hold them open or it
        // will never observe the child's hangup
        drop(child_read);
        drop(child_write);

        let mut pipe = Self {
            recv: File::from(parent_read),
            send: File::from(parent_write),
            decoder: Decoder::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = pipe.await_handshake(handshake_timeout) {
            tracing::warn!(error = %e, "child failed pipe handshake, killing it");
            kill_and_reap(&mut child, Duration::from_secs(2));
            return Err(e);
        }

        Ok((pipe, child))
    }

    /// Adopt the pipe ends a parent passed down, given the trailing argv
    /// entries. Child-process side of `spawn`.
    pub fn from_inherited_args(args: &[String]) -> Result<Self> {
        if args.len() != PIPE_ARG_COUNT {
            return Err(BridgeError::Protocol(format!(
                "expected {PIPE_ARG_COUNT} pipe arguments, got {}",
                args.len()
            )));
        }

        let mut fds = [0i32; PIPE_ARG_COUNT];
        for (slot, raw) in fds.iter_mut().zip(args) {
            *slot = raw
                .parse()
                .map_err(|_| BridgeError::Protocol(format!("bad pipe fd argument {raw:?}")))?;
        }
        let [parent_read, parent_write, child_read, child_write] = fds;

        // SAFETY: the parent created these fds and they are unowned so far
        // in this process.
        let recv = unsafe { OwnedFd::from_raw_fd(child_read) };
        let send = unsafe { OwnedFd::from_raw_fd(child_write) };
        unsafe {
            drop(OwnedFd::from_raw_fd(parent_read));
            drop(OwnedFd::from_raw_fd(parent_write));
        }

        set_nonblocking(&recv)?;

        // die with the parent rather than lingering as an orphan
        #[cfg(target_os = "linux")]
        let _ = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL);

        let pipe = Self {
            recv: File::from(recv),
            send: File::from(send),
            decoder: Decoder::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        // first byte the parent waits for
        pipe.write_raw(b"\n")?;
        Ok(pipe)
    }

    /// Whether the peer is still attached.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Encode and write one message. The write lock keeps messages from one
    /// side whole; no cross-process lock is needed since each direction is a
    /// dedicated unidirectional stream.
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.write_raw(encode(msg).as_bytes())
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::PipeClosed);
        }

        let _guard = self.write_lock.lock();
        match (&self.send).write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                self.closed.store(true, Ordering::Relaxed);
                Err(BridgeError::PipeClosed)
            }
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    /// Drain available bytes and decode at most one message. Never blocks;
    /// call from a periodic idle tick. `Ok(None)` means nothing complete is
    /// buffered yet. A `Protocol` error rejects one message only - keep
    /// polling afterwards.
    pub fn poll_once(&mut self) -> Result<Option<Message>> {
        let mut chunk = [0u8; 512];
        loop {
            match self.recv.read(&mut chunk) {
                Ok(0) => {
                    self.closed.store(true, Ordering::Relaxed);
                    break;
                }
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }

        self.decoder.decode_next()
    }

    /// Announce shutdown with an `exiting` sentinel, then wait up to
    /// `timeout` for the peer to hang up. Returns `true` for a clean,
    /// acknowledged shutdown - a crash on the other side reports `false`.
    pub fn close_gracefully(&mut self, timeout: Duration) -> bool {
        if self.send(&Message::Exiting).is_err() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while self.is_open() && Instant::now() < deadline {
            match self.poll_once() {
                // late inbound traffic is dropped; we are past handling it
                Ok(_) => {}
                Err(BridgeError::Protocol(_)) => {}
                Err(_) => break,
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        !self.is_open()
    }

    fn await_handshake(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut byte = [0u8; 1];

        loop {
            match self.recv.read(&mut byte) {
                Ok(1) if byte[0] == b'\n' => return Ok(()),
                Ok(1) => {
                    return Err(BridgeError::Protocol(format!(
                        "unexpected first byte {:#04x} from child",
                        byte[0]
                    )))
                }
                Ok(_) => return Err(BridgeError::HandshakeTimeout),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    if Instant::now() >= deadline {
                        return Err(BridgeError::HandshakeTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }
    }
}

/// Terminate a child: SIGTERM, a bounded grace period, then SIGKILL, and
/// always reap the zombie.
pub fn kill_and_reap(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => break,
        }
    }

    // a hung or broken plugin cannot be trusted to honor SIGTERM
    let _ = kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}
