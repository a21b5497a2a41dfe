//! Crash-isolated plugin discovery.
//!
//! Plugin binaries are untrusted: they crash on load, hang in constructors,
//! and lie about their exports. Discovery therefore runs every candidate in
//! a throwaway scanner process (`bravura-discovery`, see `main.rs`) and the
//! host side ([`prober`]) only ever reads its report pipe. The worst a bad
//! binary can do is cost its own probe.

pub mod error;
pub mod format;
pub mod prober;
pub mod record;
pub mod scanner;

pub use error::{is_arch_mismatch, DiscoveryError, Result};
pub use format::{FormatProbe, LibraryProbe, PluginFormat};
pub use prober::{CandidateResult, ProbeConfig, ProbeOutcome, ProbeRequest, ScanSession};
pub use record::{Notification, PluginRecord, RecordCollector};
pub use scanner::{scan, ReportSink};
