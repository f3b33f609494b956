use std::error;
use std::fmt;

use thiserror::Error;

/// Stable status codes surfaced to library callers.
///
/// Callers match on these; everything else about a failure travels in the
/// [`ErrorInfo`] tree.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Status {
    /// Caller contract violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Call made in the wrong lifecycle state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("display not found")]
    DisplayNotFound,
    #[error("display busy")]
    DisplayBusy,
    #[error("display removed")]
    DisplayRemoved,
    /// Transport-level fatal error.
    #[error("DDC communication failed: {0}")]
    CommunicationFailed(String),
    /// Retry cap hit; the per-attempt causes are the children of the
    /// enclosing [`ErrorInfo`].
    #[error("maximum tries exceeded")]
    RetriesExhausted,
    /// Specialization of [`Status::RetriesExhausted`]: every attempt ended
    /// in a null response. Discovery interprets this; nothing else should.
    #[error("all responses null")]
    AllResponsesNull,
    /// The monitor set the unsupported-feature flag in a valid reply.
    #[error("display reports feature unsupported")]
    ReportedUnsupported,
    /// Unsupported was inferred from the display's dialect.
    #[error("feature determined unsupported")]
    DeterminedUnsupported,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Reply packet with a zero-length payload.
    #[error("null response")]
    NullResponse,
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
    #[error("verification failed: set {expected:#06x}, read back {actual:#06x}")]
    VerificationFailed { expected: u16, actual: u16 },
    #[error("bad configuration file: {0}")]
    BadConfigurationFile(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Raw OS error that did not map to a more specific kind.
    #[error("i/o error: {msg}")]
    Io { errno: Option<i32>, msg: String },
}

/// How the retry engine treats a single-attempt failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Retriability {
    /// Worth another attempt.
    Retriable,
    /// The device is held by someone else; give up and report busy.
    Busy,
    /// No point retrying.
    Fatal,
}

impl Status {
    pub fn retriability(&self) -> Retriability {
        match self {
            Status::ChecksumMismatch
            | Status::NullResponse
            | Status::ShortRead { .. }
            | Status::InvalidResponse(_) => Retriability::Retriable,
            Status::DisplayBusy => Retriability::Busy,
            Status::Io { errno, .. } => match *errno {
                Some(e) if e == libc::EAGAIN || e == libc::ETIMEDOUT => Retriability::Retriable,
                Some(e) if e == libc::EBUSY => Retriability::Busy,
                _ => Retriability::Fatal,
            },
            _ => Retriability::Fatal,
        }
    }

    /// Attach a source site, producing an [`ErrorInfo`] leaf.
    pub fn at(self, site: &'static str) -> ErrorInfo {
        ErrorInfo::new(self, site)
    }
}

/// A node in an error tree: status code, source site, human message, and
/// zero or more caused-by children. The retry engine reports each failed
/// attempt as a child of a `RetriesExhausted` parent.
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    pub status: Status,
    pub site: &'static str,
    pub message: String,
    pub causes: Vec<ErrorInfo>,
}

pub type DdcResult<T> = Result<T, ErrorInfo>;

impl ErrorInfo {
    pub fn new(status: Status, site: &'static str) -> Self {
        let message = status.to_string();
        ErrorInfo {
            status,
            site,
            message,
            causes: Vec::new(),
        }
    }

    pub fn with_message(status: Status, site: &'static str, message: impl Into<String>) -> Self {
        ErrorInfo {
            status,
            site,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn caused_by(mut self, cause: ErrorInfo) -> Self {
        self.causes.push(cause);
        self
    }

    /// Builds the composite error for an exhausted retry loop.
    ///
    /// If every per-attempt cause is a null response the composite collapses
    /// to `AllResponsesNull` instead of the generic retries code; display
    /// discovery depends on the distinction.
    pub fn retries(site: &'static str, causes: Vec<ErrorInfo>) -> Self {
        let status = if !causes.is_empty()
            && causes.iter().all(|c| c.status == Status::NullResponse)
        {
            Status::AllResponsesNull
        } else {
            Status::RetriesExhausted
        };
        let message = format!("{} after {} attempts", status, causes.len());
        ErrorInfo {
            status,
            site,
            message,
            causes,
        }
    }

    pub fn all_causes_have_status(&self, status: &Status) -> bool {
        !self.causes.is_empty() && self.causes.iter().all(|c| &c.status == status)
    }

    /// Indented multi-line rendering of the tree, one node per line.
    pub fn causes_tree(&self) -> String {
        fn render(node: &ErrorInfo, depth: usize, out: &mut String) {
            for _ in 0..depth {
                out.push_str("   ");
            }
            out.push_str(&node.site);
            out.push_str(": ");
            out.push_str(&node.message);
            out.push('\n');
            for cause in &node.causes {
                render(cause, depth + 1, out);
            }
        }
        let mut out = String::new();
        render(self, 0, &mut out);
        out
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.site, self.message)?;
        if !self.causes.is_empty() {
            write!(f, " ({} causes)", self.causes.len())?;
        }
        Ok(())
    }
}

impl error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.causes.first().map(|c| c as &(dyn error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_collapse_to_all_null() {
        let causes = vec![
            Status::NullResponse.at("try"),
            Status::NullResponse.at("try"),
        ];
        let err = ErrorInfo::retries("exchange", causes);
        assert_eq!(err.status, Status::AllResponsesNull);
        assert_eq!(err.causes.len(), 2);
    }

    #[test]
    fn retries_stay_generic_when_causes_differ() {
        let causes = vec![
            Status::NullResponse.at("try"),
            Status::ChecksumMismatch.at("try"),
        ];
        let err = ErrorInfo::retries("exchange", causes);
        assert_eq!(err.status, Status::RetriesExhausted);
    }

    #[test]
    fn io_error_retriability() {
        let transient = Status::Io {
            errno: Some(libc::ETIMEDOUT),
            msg: "timed out".into(),
        };
        assert_eq!(transient.retriability(), Retriability::Retriable);

        let busy = Status::Io {
            errno: Some(libc::EBUSY),
            msg: "busy".into(),
        };
        assert_eq!(busy.retriability(), Retriability::Busy);

        let gone = Status::Io {
            errno: Some(libc::ENODEV),
            msg: "no device".into(),
        };
        assert_eq!(gone.retriability(), Retriability::Fatal);
    }

    #[test]
    fn causes_tree_renders_nested() {
        let err = Status::RetriesExhausted
            .at("get_vcp")
            .caused_by(Status::NullResponse.at("write_read"));
        let tree = err.causes_tree();
        assert!(tree.contains("get_vcp"));
        assert!(tree.contains("   write_read"));
    }
}
