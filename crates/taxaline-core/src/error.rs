//! Closed error taxonomy shared by every pipeline stage.
//!
//! Callers switch on [`ErrorCategory`], never on error text. The only place
//! that inspects messages is [`categorize_message`], which adapts foreign
//! errors (driver strings, OS errno names) into a category.

use std::fmt;
use std::io;

/// What kind of failure occurred, independent of which layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Network timeout, connection reset, DNS failure: provider may be offline.
    Transport,
    /// HTTP 404/410: the provider retired the resource.
    NotFound,
    /// Any other client error: the provider turned this request down.
    Refused,
    /// Malformed manifest or unreadable archive.
    Parse,
    /// A single record could not be normalized, enriched, or stored.
    Record,
    /// A batch write failed or exceeded store limits.
    Write,
    /// A process lock is held by someone else.
    Lock,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::NotFound => "notFound",
            Self::Refused => "refused",
            Self::Parse => "parse",
            Self::Record => "record",
            Self::Write => "write",
            Self::Lock => "lock",
        }
    }

    /// Whether the run for the affected provider should end cleanly rather than fail.
    pub fn is_clean_skip(self) -> bool {
        matches!(self, Self::NotFound | Self::Transport)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a free-form error message to a category.
///
/// Returns `None` when nothing recognizable is found so the caller can pick
/// its own default.
pub fn categorize_message(message: &str) -> Option<ErrorCategory> {
    const TRANSPORT_MARKERS: &[&str] = &[
        "econnreset",
        "econnrefused",
        "econnaborted",
        "etimedout",
        "enotfound",
        "eai_again",
        "ehostunreach",
        "enetunreach",
        "connection reset",
        "connection refused",
        "connection closed",
        "broken pipe",
        "timed out",
        "timeout",
        "dns error",
        "failed to lookup address",
        "socket hang up",
        "network is unreachable",
    ];
    const NOT_FOUND_MARKERS: &[&str] = &["404", "410 gone", "not found"];

    let lower = message.to_ascii_lowercase();
    if TRANSPORT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(ErrorCategory::Transport);
    }
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(ErrorCategory::NotFound);
    }
    None
}

/// Categorize a local or socket-level I/O error.
pub fn categorize_io(err: &io::Error) -> ErrorCategory {
    use io::ErrorKind as K;
    match err.kind() {
        K::TimedOut
        | K::ConnectionReset
        | K::ConnectionRefused
        | K::ConnectionAborted
        | K::NotConnected
        | K::BrokenPipe
        | K::UnexpectedEof => ErrorCategory::Transport,
        K::InvalidData => ErrorCategory::Parse,
        _ => categorize_message(&err.to_string()).unwrap_or(ErrorCategory::Write),
    }
}
