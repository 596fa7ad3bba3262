//! Error taxonomy shared by the script guest, the raster guest and the
//! resource policies.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Instance could not be built (missing export, failed instantiation,
    /// bad bundle, bad policy setup). No instance is produced.
    #[error("construction failed: {0}")]
    Construction(String),

    /// Host access to guest linear memory outside the allocated range.
    #[error("guest memory access out of bounds: {what} at {ptr}+{len}")]
    Bounds {
        what: &'static str,
        ptr: u32,
        len: usize,
    },

    /// The guest reported a failure (negative status + error buffer, or a
    /// script exception).
    #[error("guest error: {0}")]
    Guest(String),

    /// The guest terminated abnormally during this call. The instance is now
    /// sealed.
    #[error("guest fault: {0}")]
    GuestFault(String),

    /// The guest invoked a host capability that was never configured.
    #[error("capability not configured: {0}")]
    CapabilityNotConfigured(&'static str),

    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    /// Fetch or file read failed after a successful sanitize.
    #[error("failed to load {uri:?}: {reason}")]
    Transport { uri: String, reason: String },

    #[error("runtime sealed after an internal guest fault; create a new converter")]
    Sealed,

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Defects that no change of input can fix.
    pub fn is_host_defect(&self) -> bool {
        matches!(self, Error::Construction(_) | Error::Bounds { .. })
    }

    pub(crate) fn transport(uri: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a resource policy refused a URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanitizeError {
    #[error("unsupported scheme {scheme:?} in {uri:?}")]
    UnsupportedScheme { scheme: String, uri: String },

    #[error("URI {uri:?} contains userinfo")]
    EmbeddedCredentials { uri: String },

    #[error("domain {host:?} not in allowed list for {uri:?}")]
    DomainNotAllowed { host: String, uri: String },

    #[error("relative URI {uri:?} not allowed (no base URL configured)")]
    MissingBase { uri: String },

    #[error("path traversal in {uri:?}")]
    PathTraversal { uri: String },

    #[error("absolute path {uri:?} not allowed")]
    AbsolutePath { uri: String },

    #[error("invalid URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("resource loading denied for {uri:?}")]
    Denied { uri: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_defects() {
        assert!(Error::Construction("missing export".into()).is_host_defect());
        assert!(Error::Bounds {
            what: "input",
            ptr: 1,
            len: 2
        }
        .is_host_defect());

        assert!(!Error::Sealed.is_host_defect());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_host_defect());
        assert!(!Error::Guest("bad spec".into()).is_host_defect());
        assert!(!Error::from(SanitizeError::Denied { uri: "x".into() }).is_host_defect());
    }

    #[test]
    fn test_sanitize_reasons_are_distinct() {
        let uri = "https://user@host/".to_string();
        let reasons = [
            SanitizeError::UnsupportedScheme {
                scheme: "ftp".into(),
                uri: uri.clone(),
            },
            SanitizeError::EmbeddedCredentials { uri: uri.clone() },
            SanitizeError::DomainNotAllowed {
                host: "host".into(),
                uri: uri.clone(),
            },
            SanitizeError::PathTraversal { uri: uri.clone() },
        ];
        for (i, a) in reasons.iter().enumerate() {
            for (j, b) in reasons.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
