//! Discovery error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to spawn scanner process: {0}")]
    Spawn(std::io::Error),

    #[error("failed to load plugin binary: {0}")]
    Load(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error("bridge error: {0}")]
    Bridge(#[from] bravura_bridge::BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Loader error texts that mean "wrong architecture", not "broken plugin".
/// A scan can be retried under an alternate-architecture scanner when one
/// of these shows up.
const ARCH_MISMATCH_SIGNATURES: &[&str] = &[
    "wrong ELF class",
    "invalid ELF header",
    "Bad EXE format",
    "no suitable image found",
    "not a valid Win32 application",
];

/// Whether a loader error text matches a known architecture-mismatch
/// signature. Requires the error text to be locale-neutral (`LC_ALL=C`).
pub fn is_arch_mismatch(text: &str) -> bool {
    ARCH_MISMATCH_SIGNATURES.iter().any(|sig| text.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_mismatch_signatures() {
        assert!(is_arch_mismatch(
            "/usr/lib/foo.so: wrong ELF class: ELFCLASS32"
        ));
        assert!(is_arch_mismatch(
            "dlopen(foo.dylib, 5): no suitable image found"
        ));
        assert!(!is_arch_mismatch("undefined symbol: ladspa_descriptor"));
        assert!(!is_arch_mismatch(""));
    }
}
