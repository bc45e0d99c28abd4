//! Failure classification for compose apply output.
//!
//! The retry loop never inspects errors itself; it asks this classifier
//! whether the combined diagnostic text looks like a transient
//! registry/network failure or a fatal configuration problem. Keeping the
//! policy separate from the retry mechanics lets both be tested alone.

/// How a failed apply should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Expected to self-resolve; worth retrying with backoff.
    Transient,
    /// Configuration or authorization problem; retrying cannot help.
    Fatal,
}

/// Patterns marking failures that retrying cannot fix. Checked first so an
/// authorization denial inside a noisy network trace still aborts.
const FATAL_PATTERNS: [&str; 10] = [
    "port is already allocated",
    "address already in use",
    "pull access denied",
    "unauthorized",
    "authentication required",
    "manifest unknown",
    "repository does not exist",
    "no such image",
    "invalid compose file",
    "yaml:",
];

/// Patterns marking registry/network flakiness worth retrying.
const TRANSIENT_PATTERNS: [&str; 12] = [
    "connection reset",
    "connection refused",
    "timeout",
    "timed out",
    "temporary failure in name resolution",
    "server misbehaving",
    "context deadline exceeded",
    "internal server error",
    "service unavailable",
    "bad gateway",
    "received unexpected http status",
    "unexpected eof",
];

/// Classify the combined stdout/stderr of a failed apply.
///
/// Unrecognized failures are fatal: retrying an unknown error hides broken
/// configuration behind the retry budget.
pub fn classify_failure(text: &str) -> FailureKind {
    let lowered = text.to_lowercase();

    if FATAL_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return FailureKind::Fatal;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return FailureKind::Transient;
    }
    FailureKind::Fatal
}
