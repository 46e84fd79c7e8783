//! Version information and protocol compatibility policies.

/// ipc-bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version spoken by this crate's bridge and worker runtime.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Decides whether a worker's advertised protocol version is acceptable.
///
/// Plugged into [`crate::BridgeConfig`]; closures `Fn(&str, &str) -> bool`
/// (worker, expected) implement it too.
pub trait VersionPolicy: Send + Sync {
    fn is_compatible(&self, worker: &str, expected: &str) -> bool;
}

impl<F> VersionPolicy for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn is_compatible(&self, worker: &str, expected: &str) -> bool {
        self(worker, expected)
    }
}

/// Versions must be identical (after trimming whitespace).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl VersionPolicy for ExactMatch {
    fn is_compatible(&self, worker: &str, expected: &str) -> bool {
        worker.trim() == expected.trim()
    }
}

/// Versions must share a major component (`1.2` accepts `1.0`, rejects `2.0`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SameMajor;

impl VersionPolicy for SameMajor {
    fn is_compatible(&self, worker: &str, expected: &str) -> bool {
        match (major(worker), major(expected)) {
            (Some(w), Some(e)) => w == e,
            _ => false,
        }
    }
}

fn major(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_requires_identical_versions() {
        assert!(ExactMatch.is_compatible("1.0", "1.0"));
        assert!(ExactMatch.is_compatible(" 1.0\n", "1.0"));
        assert!(!ExactMatch.is_compatible("1.1", "1.0"));
    }

    #[test]
    fn same_major_accepts_minor_drift() {
        assert!(SameMajor.is_compatible("1.4", "1.0"));
        assert!(SameMajor.is_compatible("v1.0.3", "1"));
        assert!(!SameMajor.is_compatible("2.0", "1.9"));
        assert!(!SameMajor.is_compatible("garbage", "1.0"));
    }

    #[test]
    fn closures_are_policies() {
        let anything = |_: &str, _: &str| true;
        assert!(anything.is_compatible("0.1", "9.9"));
    }

    #[test]
    fn protocol_version_is_stable() {
        assert_eq!(PROTOCOL_VERSION, "1.0");
        assert!(!BRIDGE_VERSION.is_empty());
    }
}
