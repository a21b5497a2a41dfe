//! Process-shared semaphores in fixed-width slots.
//!
//! Each slot is 32 bytes regardless of the native `sem_t` size, so a peer
//! built against a different libc (or pointer width) still agrees on every
//! offset in the shared control block. The byte layout, not the platform
//! struct layout, is the contract.

use crate::error::{BridgeError, Result};
use std::time::Duration;

/// Fixed slot width in the shared segment.
pub const SEM_SLOT_SIZE: usize = 32;

// the platform semaphore must fit its slot
const _: () = assert!(std::mem::size_of::<libc::sem_t>() <= SEM_SLOT_SIZE);
const _: () = assert!(std::mem::align_of::<libc::sem_t>() <= 8);

/// One semaphore slot inside shared memory.
///
/// All operations go through a raw pointer because the slot's memory is
/// shared between processes; Rust references never alias it mutably.
#[repr(C, align(8))]
pub struct SemSlot {
    storage: [u8; SEM_SLOT_SIZE],
}

impl SemSlot {
    fn raw(&self) -> *mut libc::sem_t {
        self.storage.as_ptr() as *mut libc::sem_t
    }

    /// Initialize as an unsignaled, process-shared semaphore.
    ///
    /// # Safety
    /// The slot must be in shared memory and must not already hold a live
    /// semaphore. Only the segment creator may call this.
    pub unsafe fn init(&self) -> Result<()> {
        if libc::sem_init(self.raw(), 1, 0) != 0 {
            return Err(BridgeError::SharedMemory(format!(
                "sem_init failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// # Safety
    /// Must only run once, on the creator side, after the peer is gone.
    pub unsafe fn destroy(&self) {
        libc::sem_destroy(self.raw());
    }

    /// Signal the counterpart. Async-signal-safe and non-blocking.
    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.raw());
        }
    }

    /// Wait for a signal, bounded by `timeout`.
    #[cfg(target_os = "linux")]
    pub fn timed_wait(&self, timeout: Duration) -> Result<()> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }

        let nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + nsec / 1_000_000_000,
            tv_nsec: nsec % 1_000_000_000,
        };

        loop {
            let ret = unsafe { libc::sem_timedwait(self.raw(), &deadline) };
            if ret == 0 {
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => {
                    return Err(BridgeError::TransportTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
                _ => {
                    return Err(BridgeError::SharedMemory(format!(
                        "sem_timedwait failed: {}",
                        std::io::Error::last_os_error()
                    )))
                }
            }
        }
    }

    /// Wait for a signal, bounded by `timeout`.
    ///
    /// macOS has no `sem_timedwait`; poll with `sem_trywait` instead.
    #[cfg(not(target_os = "linux"))]
    pub fn timed_wait(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        loop {
            if unsafe { libc::sem_trywait(self.raw()) } == 0 {
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                _ => {
                    return Err(BridgeError::SharedMemory(format!(
                        "sem_trywait failed: {}",
                        std::io::Error::last_os_error()
                    )))
                }
            }
            if start.elapsed() >= timeout {
                return Err(BridgeError::TransportTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}
