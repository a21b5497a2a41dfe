//! Shared-memory transport segment with dual-semaphore turn handoff.
//!
//! The host creates the segment; the bridged process maps it. Ownership of
//! the ring alternates between the two sides: whoever holds the turn may
//! write or read frames freely, then posts the counterpart's semaphore and
//! waits on its own. Only one side is ever active between handoffs, which is
//! the whole correctness argument - no frame can straddle a concurrent read
//! and write, so no cross-process fences are needed beyond the semaphores.
//!
//! The byte layout of the control block is the wire contract. Capacity,
//! semaphore slot width, and field offsets are validated at attach time and
//! asserted at compile time.

use crate::error::{BridgeError, Result};
use crate::ring::{RingFrame, RingState, RingView};
use crate::sem::{SemSlot, SEM_SLOT_SIZE};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Fixed ring capacity, part of the segment ABI.
pub const RING_CAPACITY: usize = 2048;

/// Segment layout as mapped by both processes.
#[repr(C)]
struct ControlBlock {
    /// Posted by the peer to give the host its turn.
    turn_to_host: SemSlot,
    /// Posted by the host to give the peer its turn.
    turn_to_peer: SemSlot,
    ring: RingState,
    data: [u8; RING_CAPACITY],
}

/// Total segment size; both sides must agree exactly.
pub const SEGMENT_SIZE: usize = std::mem::size_of::<ControlBlock>();

// wire-exact layout: two padded semaphore slots, ring state, storage
const _: () = assert!(std::mem::offset_of!(ControlBlock, turn_to_host) == 0);
const _: () = assert!(std::mem::offset_of!(ControlBlock, turn_to_peer) == SEM_SLOT_SIZE);
const _: () = assert!(std::mem::offset_of!(ControlBlock, ring) == 2 * SEM_SLOT_SIZE);
const _: () = assert!(std::mem::offset_of!(ControlBlock, data) == 2 * SEM_SLOT_SIZE + 16);
const _: () = assert!(SEGMENT_SIZE == 2 * SEM_SLOT_SIZE + 16 + RING_CAPACITY);

/// Which end of the bridge this mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Peer,
}

/// One side of a shared-memory ring transport.
///
/// Uses `UnsafeCell` for interior mutability since the mapped region is
/// written through an immutable reference; this is sound because the handoff
/// protocol guarantees only the turn holder touches the ring, and the
/// semaphore slots are only ever accessed through raw libc calls.
pub struct SharedRing {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    path: PathBuf,
    role: Role,
}

impl std::fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRing")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

// SAFETY: access to the ring is serialized by the handoff protocol and the
// semaphore operations are thread-safe by POSIX.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    /// Create and initialize a fresh segment (host side). Both semaphores
    /// start unsignaled, the ring empty; the host holds the first turn.
    pub fn create(name: &str) -> Result<Self> {
        let path = segment_path(name);

        let file = {
            #[cfg(unix)]
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .map_err(|e| {
                    BridgeError::SharedMemory(format!("failed to create segment: {e}"))
                })?
        };
        file.set_len(SEGMENT_SIZE as u64)
            .map_err(|e| BridgeError::SharedMemory(format!("failed to size segment: {e}")))?;

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| BridgeError::SharedMemory(format!("failed to map segment: {e}")))?;

        let transport = Self {
            mmap: UnsafeCell::new(mmap),
            name: name.to_owned(),
            path,
            role: Role::Host,
        };

        let block = transport.block();
        unsafe {
            block.turn_to_host.init()?;
            block.turn_to_peer.init()?;
        }

        tracing::debug!(name, size = SEGMENT_SIZE, "created shared transport");
        Ok(transport)
    }

    /// Map an existing segment (bridged-process side).
    ///
    /// The segment's size is the layout fingerprint: any disagreement about
    /// capacity or struct layout shows up as a size mismatch and is a hard
    /// attach failure.
    pub fn attach(name: &str) -> Result<Self> {
        let path = segment_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| BridgeError::AttachFailed(format!("{}: {e}", path.display())))?;

        let actual = file
            .metadata()
            .map_err(|e| BridgeError::AttachFailed(e.to_string()))?
            .len();
        if actual != SEGMENT_SIZE as u64 {
            return Err(BridgeError::AttachFailed(format!(
                "segment size {actual} does not match expected layout of {SEGMENT_SIZE} bytes"
            )));
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| BridgeError::AttachFailed(format!("failed to map segment: {e}")))?;

        tracing::debug!(name, "attached shared transport");
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name: name.to_owned(),
            path,
            role: Role::Peer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Stage one frame. Caller must hold the turn. Returns `false` when the
    /// frame cannot fit (the in-flight frame is dropped at commit,
    /// previously committed frames are untouched).
    pub fn write_frame(&self, opcode: u8, payload: &[u8]) -> bool {
        self.ring_view().write_frame(opcode, payload)
    }

    /// Publish staged frames. Caller must hold the turn.
    pub fn commit(&self) -> bool {
        self.ring_view().commit()
    }

    /// Pop the next committed frame. Caller must hold the turn.
    ///
    /// A `MalformedFrame` error means this transport instance is corrupt and
    /// must be discarded whole.
    pub fn read_frame(&self) -> Result<Option<RingFrame>> {
        self.ring_view().read_frame()
    }

    /// Drop all ring state. Used when recycling after corruption teardown.
    pub fn clear_ring(&self) {
        self.ring_view().clear()
    }

    /// Give the turn to the other side. Never blocks.
    pub fn hand_off(&self) {
        match self.role {
            Role::Host => self.block().turn_to_peer.post(),
            Role::Peer => self.block().turn_to_host.post(),
        }
    }

    /// Block until the counterpart hands the turn back, bounded by
    /// `timeout`. This is the only blocking primitive in the transport;
    /// real-time callers must always pass a bounded timeout.
    pub fn wait_for_turn(&self, timeout: Duration) -> Result<()> {
        let slot = match self.role {
            Role::Host => &self.block().turn_to_host,
            Role::Peer => &self.block().turn_to_peer,
        };
        slot.timed_wait(timeout)
    }

    fn block(&self) -> &ControlBlock {
        // SAFETY: the mapping is exactly SEGMENT_SIZE and ControlBlock is
        // repr(C) with asserted offsets.
        unsafe { &*((*self.mmap.get()).as_ptr() as *const ControlBlock) }
    }

    fn ring_view(&self) -> RingView<'_> {
        // SAFETY: only the turn holder calls ring operations, so no aliasing
        // mutable access exists while this view is alive.
        unsafe {
            let block = &mut *((*self.mmap.get()).as_mut_ptr() as *mut ControlBlock);
            RingView::new(&mut block.ring, &mut block.data)
        }
    }
}

impl Drop for SharedRing {
    fn drop(&mut self) {
        if self.role == Role::Host {
            // peer must already be gone by the time the host tears down
            let block = self.block();
            unsafe {
                block.turn_to_host.destroy();
                block.turn_to_peer.destroy();
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn segment_path(name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");

    #[cfg(not(target_os = "linux"))]
    let base = std::env::temp_dir();

    base.join(format!("bravura_{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("test_{tag}_{}", std::process::id())
    }

    #[test]
    fn test_create_attach_roundtrip() {
        let name = unique_name("rt");
        let host = SharedRing::create(&name).unwrap();
        let peer = SharedRing::attach(&name).unwrap();

        assert!(host.write_frame(0x10, b"param 3 = 0.5"));
        assert!(host.write_frame(0x20, &[0x90, 64, 127]));
        assert!(host.commit());

        let first = peer.read_frame().unwrap().unwrap();
        assert_eq!(first.opcode, 0x10);
        assert_eq!(first.payload, b"param 3 = 0.5");

        let second = peer.read_frame().unwrap().unwrap();
        assert_eq!(second.opcode, 0x20);
        assert_eq!(second.payload, vec![0x90, 64, 127]);

        assert!(peer.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_attach_missing_segment_fails() {
        let err = SharedRing::attach("test_no_such_segment").unwrap_err();
        assert!(matches!(err, BridgeError::AttachFailed(_)), "{err}");
    }

    #[test]
    fn test_attach_wrong_size_fails() {
        let name = unique_name("short");
        let path = segment_path(&name);
        std::fs::write(&path, [0u8; 128]).unwrap();

        let err = SharedRing::attach(&name).unwrap_err();
        assert!(matches!(err, BridgeError::AttachFailed(_)), "{err}");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_turn_handoff_across_mappings() {
        let name = unique_name("turn");
        let host = SharedRing::create(&name).unwrap();
        let peer = SharedRing::attach(&name).unwrap();

        // nobody has posted the host's turn yet
        let err = host.wait_for_turn(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, BridgeError::TransportTimeout { .. }), "{err}");

        // peer hands the turn to the host; host hands it back
        peer.hand_off();
        host.wait_for_turn(Duration::from_millis(500)).unwrap();
        host.hand_off();
        peer.wait_for_turn(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn test_host_drop_unlinks_segment() {
        let name = unique_name("unlink");
        let path = {
            let host = SharedRing::create(&name).unwrap();
            let path = segment_path(host.name());
            assert!(path.exists());
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_oversized_frame_preserves_committed_data() {
        let name = unique_name("ovf");
        let host = SharedRing::create(&name).unwrap();

        assert!(host.write_frame(1, &[7; 64]));
        assert!(host.commit());

        assert!(!host.write_frame(2, &[0; RING_CAPACITY]));
        assert!(!host.commit());

        let frame = host.read_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, 1);
        assert_eq!(frame.payload, vec![7; 64]);
    }
}
