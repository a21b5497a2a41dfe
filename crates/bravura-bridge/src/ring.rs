//! Circular byte store with staged frame commits.
//!
//! The ring lives inside the shared control block (`shm` module) but the
//! logic is plain byte arithmetic over a state struct and a storage slice,
//! so it is testable against local memory too.
//!
//! A frame is `opcode: u8` + `len: u16 LE` + payload, wrapping byte-wise.
//! The writer stages bytes past `tail` (tracked by `written`) and makes them
//! visible in one step with `commit`; if a frame does not fit, `invalidate`
//! is raised and commit discards the in-flight frame in its entirety.
//! Committed frames are never touched, and a reader can never observe a
//! half-written frame: the handoff protocol guarantees only one side runs at
//! a time, and only committed spans are readable.

use crate::error::{BridgeError, Result};

/// Framed record header size: opcode byte + little-endian u16 length.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Ring bookkeeping, laid out exactly as it appears in the shared segment.
#[derive(Debug, Default)]
#[repr(C)]
pub struct RingState {
    /// Next committed byte to read.
    pub head: u32,
    /// End of the committed span.
    pub tail: u32,
    /// Staged write cursor; equal to `tail` when nothing is in flight.
    pub written: u32,
    /// Nonzero: discard the in-flight frame at the next commit.
    pub invalidate: u32,
}

/// One frame read back out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingFrame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Mutable view over ring state plus its byte storage.
///
/// The shared-memory transport materializes one of these per operation;
/// tests back it with a local buffer.
pub struct RingView<'a> {
    state: &'a mut RingState,
    data: &'a mut [u8],
}

impl<'a> RingView<'a> {
    pub fn new(state: &'a mut RingState, data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() > FRAME_HEADER_SIZE);
        Self { state, data }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn distance(&self, from: u32, to: u32) -> usize {
        let (from, to) = (from as usize, to as usize);
        if to >= from {
            to - from
        } else {
            self.capacity() - from + to
        }
    }

    /// Committed bytes available to the reader.
    fn committed(&self) -> usize {
        self.distance(self.state.head, self.state.tail)
    }

    /// Free bytes available for staging. One byte is kept back so a full
    /// ring is distinguishable from an empty one.
    fn free(&self) -> usize {
        self.capacity() - 1 - self.distance(self.state.head, self.state.written)
    }

    pub fn is_empty(&self) -> bool {
        self.state.head == self.state.tail
    }

    /// Stage one frame. Returns `false` (and raises `invalidate`) when the
    /// frame cannot fit; previously committed frames are unaffected.
    pub fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> bool {
        if self.state.invalidate != 0 {
            return false;
        }
        if payload.len() > u16::MAX as usize
            || FRAME_HEADER_SIZE + payload.len() > self.free()
        {
            self.state.invalidate = 1;
            return false;
        }

        let len = payload.len() as u16;
        self.put(opcode);
        self.put(len as u8);
        self.put((len >> 8) as u8);
        for &b in payload {
            self.put(b);
        }
        true
    }

    /// Publish everything staged since the last commit. Returns `false` when
    /// the staged frame was invalidated, in which case it vanishes entirely.
    pub fn commit(&mut self) -> bool {
        if self.state.invalidate != 0 {
            self.state.invalidate = 0;
            self.state.written = self.state.tail;
            return false;
        }
        self.state.tail = self.state.written;
        true
    }

    /// Pop the next committed frame, front to back.
    ///
    /// A header whose declared length overruns the committed span means the
    /// ring is corrupt; the transport instance must be discarded.
    pub fn read_frame(&mut self) -> Result<Option<RingFrame>> {
        if self.is_empty() {
            return Ok(None);
        }

        let committed = self.committed();
        if committed < FRAME_HEADER_SIZE {
            return Err(BridgeError::MalformedFrame(format!(
                "committed span of {committed} bytes cannot hold a header"
            )));
        }

        let opcode = self.get(0);
        let len = self.get(1) as usize | (self.get(2) as usize) << 8;
        if FRAME_HEADER_SIZE + len > committed {
            return Err(BridgeError::MalformedFrame(format!(
                "frame length {len} overruns committed span of {committed} bytes"
            )));
        }

        let mut payload = vec![0u8; len];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = self.get(FRAME_HEADER_SIZE + i);
        }
        self.state.head = (self.state.head as usize + FRAME_HEADER_SIZE + len) as u32
            % self.capacity() as u32;

        Ok(Some(RingFrame { opcode, payload }))
    }

    /// Reset to the pristine empty state. Used when a host recycles a
    /// segment after tearing down a corrupted transport.
    pub fn clear(&mut self) {
        self.state.head = 0;
        self.state.tail = 0;
        self.state.written = 0;
        self.state.invalidate = 0;
    }

    fn put(&mut self, byte: u8) {
        let pos = self.state.written as usize % self.capacity();
        self.data[pos] = byte;
        self.state.written = (pos + 1) as u32 % self.capacity() as u32;
    }

    fn get(&self, offset: usize) -> u8 {
        self.data[(self.state.head as usize + offset) % self.capacity()]
    }
}

/// Heap-backed ring with the same framing, for local use and tests.
pub struct HeapRing {
    state: RingState,
    data: Vec<u8>,
}

impl HeapRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RingState::default(),
            data: vec![0; capacity],
        }
    }

    pub fn view(&mut self) -> RingView<'_> {
        RingView::new(&mut self.state, &mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring_reads_none() {
        let mut ring = HeapRing::new(64);
        assert!(ring.view().read_frame().unwrap().is_none());
        assert!(ring.view().is_empty());
    }

    #[test]
    fn test_fifo_roundtrip_byte_identical() {
        let mut ring = HeapRing::new(2048);
        let frames: Vec<(u8, Vec<u8>)> = vec![
            (1, vec![]),
            (2, vec![0xAA; 100]),
            (3, (0u8..=255).collect()),
            (4, b"parameter change".to_vec()),
        ];

        {
            let mut v = ring.view();
            for (op, payload) in &frames {
                assert!(v.write_frame(*op, payload));
            }
            assert!(v.commit());
        }

        let mut v = ring.view();
        for (op, payload) in &frames {
            let frame = v.read_frame().unwrap().unwrap();
            assert_eq!(frame.opcode, *op);
            assert_eq!(&frame.payload, payload);
        }
        assert!(v.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_frame_invisible_to_reader() {
        let mut ring = HeapRing::new(256);
        let mut v = ring.view();
        assert!(v.write_frame(9, b"staged"));
        // no commit yet
        assert!(v.read_frame().unwrap().is_none());
        assert!(v.commit());
        assert_eq!(v.read_frame().unwrap().unwrap().opcode, 9);
    }

    #[test]
    fn test_wraparound_integrity() {
        // Cycle frames through a small ring so headers and payloads land on
        // every offset, including straddling the end of storage.
        let mut ring = HeapRing::new(32);
        for i in 0..200u32 {
            let payload = [i as u8, (i >> 8) as u8, 0x5A];
            let mut v = ring.view();
            assert!(v.write_frame((i % 251) as u8, &payload));
            assert!(v.commit());

            let frame = v.read_frame().unwrap().unwrap();
            assert_eq!(frame.opcode, (i % 251) as u8);
            assert_eq!(frame.payload, payload);
            assert!(v.is_empty());
        }
    }

    #[test]
    fn test_overflow_invalidates_only_inflight_frame() {
        let mut ring = HeapRing::new(64);

        {
            let mut v = ring.view();
            assert!(v.write_frame(1, &[0x11; 20]));
            assert!(v.commit());
        }

        {
            let mut v = ring.view();
            // 64-byte ring cannot take another 60-byte payload
            assert!(!v.write_frame(2, &[0x22; 60]));
            assert!(!v.commit());
        }

        // the committed frame is intact; the oversized one vanished entirely
        let mut v = ring.view();
        let frame = v.read_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, 1);
        assert_eq!(frame.payload, vec![0x11; 20]);
        assert!(v.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_writes_after_invalidate_resume_cleanly() {
        let mut ring = HeapRing::new(64);

        {
            let mut v = ring.view();
            assert!(!v.write_frame(1, &[0; 100]));
            // further writes in the same doomed batch are ignored
            assert!(!v.write_frame(2, &[0; 4]));
            assert!(!v.commit());
        }

        let mut v = ring.view();
        assert!(v.write_frame(3, b"ok"));
        assert!(v.commit());
        assert_eq!(v.read_frame().unwrap().unwrap().opcode, 3);
    }

    #[test]
    fn test_malformed_length_is_fatal() {
        let mut ring = HeapRing::new(64);
        {
            let mut v = ring.view();
            assert!(v.write_frame(1, b"abc"));
            assert!(v.commit());
        }
        // corrupt the declared length beyond the committed span
        ring.data[1] = 0xFF;
        ring.data[2] = 0x7F;

        let err = ring.view().read_frame().unwrap_err();
        assert!(matches!(err, BridgeError::MalformedFrame(_)), "{err}");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut ring = HeapRing::new(64);
        {
            let mut v = ring.view();
            v.write_frame(1, b"x");
            v.commit();
        }
        ring.view().clear();
        assert!(ring.view().is_empty());
        assert!(ring.view().read_frame().unwrap().is_none());
    }

    #[test]
    fn test_fill_to_capacity_minus_one() {
        // exactly capacity-1 bytes of framed data must fit
        let mut ring = HeapRing::new(64);
        let mut v = ring.view();
        assert!(v.write_frame(1, &[0xEE; 60])); // 3 + 60 = 63 = capacity - 1
        assert!(v.commit());
        let frame = v.read_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 60);
    }
}
