use std::fmt;

/// Failure categories for a handshake or driver operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No device attached at the endpoint (expected steady state, skipped silently)
    Unavailable,
    /// Device or USB interface held by another process, or still settling
    Busy,
    /// Handshake waiting for the user to accept the on-device trust dialog
    AuthPending,
    /// Anything else
    Unclassified,
}

/// Categorized transport errors with actionable guidance
#[derive(Debug, Clone)]
pub struct TransportError {
    /// Failure category, drives the orchestrator's recovery
    pub kind: FailureKind,
    /// Condensed description of what failed
    pub message: String,
}

impl TransportError {
    /// Build an error of a known kind
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Parse driver stderr to categorize the error
    ///
    /// Matches the messages the device bridge prints for missing devices,
    /// contended USB interfaces and pending authorization.
    #[must_use]
    pub fn from_stderr(command: &str, stderr: &str) -> Self {
        let stderr_lower = stderr.to_lowercase();
        let message = format!("{}: {}", command, extract_meaningful_message(stderr));

        // Authorization first: "device unauthorized" also contains "device"
        if stderr_lower.contains("unauthorized")
            || stderr_lower.contains("authorizing")
            || stderr_lower.contains("authentication")
        {
            return Self::new(FailureKind::AuthPending, message);
        }

        if stderr_lower.contains("busy")
            || stderr_lower.contains("could not claim interface")
            || stderr_lower.contains("doesn't match this client")
            || stderr_lower.contains("device offline")
            || stderr_lower.contains("still connecting")
        {
            return Self::new(FailureKind::Busy, message);
        }

        if stderr_lower.contains("no devices")
            || stderr_lower.contains("not found")
            || stderr_lower.contains("no such device")
            || stderr_lower.contains("no route to host")
            || stderr_lower.contains("connection refused")
            || stderr_lower.contains("failed to connect")
        {
            return Self::new(FailureKind::Unavailable, message);
        }

        Self::new(FailureKind::Unclassified, message)
    }

    /// Get a user-friendly error message with actionable guidance
    #[must_use]
    pub fn user_message(&self) -> String {
        let msg = &self.message;
        match self.kind {
            FailureKind::Unavailable => format!(
                "{msg}\n\nSuggestions:\n\
                 - Check the USB cable or that the device is on this network\n\
                 - Run 'devsync devices' to see known addresses"
            ),
            FailureKind::Busy => format!(
                "{msg}\n\nSuggestions:\n\
                 - Close other tools that talk to the device (IDEs, other adb servers)\n\
                 - Replug the device and try again"
            ),
            FailureKind::AuthPending => format!(
                "{msg}\n\nSuggestions:\n\
                 - Unlock the device and accept the debugging authorization dialog\n\
                 - Tick 'Always allow from this computer' to skip it next time"
            ),
            FailureKind::Unclassified => format!(
                "{msg}\n\nThis is an unexpected error. Please check the message above for details."
            ),
        }
    }

    /// Check if this error type is transient and might succeed on retry
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self.kind, FailureKind::Busy | FailureKind::AuthPending)
    }

    /// Get a short description of the error type
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self.kind {
            FailureKind::Unavailable => "Transport Unavailable",
            FailureKind::Busy => "Transport Busy",
            FailureKind::AuthPending => "Authorization Pending",
            FailureKind::Unclassified => "Unknown Error",
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message)
    }
}

impl std::error::Error for TransportError {}

/// Extract the most meaningful part of the error message
///
/// Removes noise and focuses on the actual error description
fn extract_meaningful_message(stderr: &str) -> String {
    // Take first 3 non-empty lines (usually contains the key info)
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(3)
        .collect();

    if lines.is_empty() {
        return "No error details available".to_string();
    }

    lines.join(" | ")
}
