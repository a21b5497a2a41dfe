//! # Bravura - plugin bridging and discovery
//!
//! Umbrella crate over two subsystems:
//! - **bravura-bridge** - transport between a host and a per-plugin child
//!   process: a line-oriented control pipe plus a shared-memory ring with a
//!   two-semaphore turn handoff.
//! - **bravura-discovery** - crash-isolated plugin scanning: every
//!   candidate binary is probed in a throwaway child process, and a crash,
//!   hang, or lie costs exactly one candidate.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bravura::prelude::*;
//!
//! let mut session = ScanSession::new(ProbeConfig::default());
//! session.run(&[(PluginFormat::Vst3, "/usr/lib/vst3/Surge.vst3".into())])?;
//!
//! for result in session.results() {
//!     for record in result.outcome.records() {
//!         println!("{:?}", record.get(RecordKey::Name));
//!     }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `discovery` (default) - host-side probing and the scanner binary

/// Re-export of bravura-bridge for direct access
pub use bravura_bridge as bridge;

#[cfg(feature = "discovery")]
/// Re-export of bravura-discovery for direct access
pub use bravura_discovery as discovery;

pub use bravura_bridge::{
    BridgeError, ControlPipe, Decoder, Message, RecordKey, Severity, SharedRing,
};

#[cfg(feature = "discovery")]
pub use bravura_discovery::{
    DiscoveryError, PluginFormat, PluginRecord, ProbeConfig, ProbeOutcome, ProbeRequest,
    ScanSession,
};

/// Common imports for host code.
pub mod prelude {
    pub use bravura_bridge::{ControlPipe, Message, RecordKey, Role, Severity, SharedRing};

    #[cfg(feature = "discovery")]
    pub use bravura_discovery::{
        PluginFormat, PluginRecord, ProbeConfig, ProbeOutcome, ScanSession,
    };
}
