//! Process-isolation transport for plugin hosting.
//!
//! A host process and a per-plugin child communicate over two channels:
//!
//! - **Control pipe** ([`pipe::ControlPipe`]) - a pair of anonymous pipes
//!   carrying a line-oriented text protocol ([`codec`]) for UI and parameter
//!   traffic. Non-blocking, polled from an idle tick.
//! - **Shared ring** ([`shm::SharedRing`]) - a memory-mapped ring buffer
//!   with a two-semaphore turn handoff for bulk realtime traffic.
//!
//! Either channel survives a malformed message from the other side; a dead
//! peer is reported as an error, never as a hang.

pub mod codec;
pub mod error;
pub mod pipe;
pub mod ring;
pub mod sem;
pub mod shm;

pub use codec::{encode, Decoder, Message, RecordKey, Severity};
pub use error::{BridgeError, Result};
pub use pipe::{kill_and_reap, ControlPipe};
pub use ring::{RingFrame, RingState, RingView};
pub use shm::{Role, SharedRing, RING_CAPACITY, SEGMENT_SIZE};
