use camino::Utf8PathBuf;
use cryptoki_sys::CK_RV;

/// Errors surfaced by the device layer.
///
/// Lookup misses are not errors: read operations return `Ok(None)` when an
/// alias resolves to nothing. Everything that reaches a caller as `Err` is
/// either a caller mistake, a token fault, or a native return code.
#[derive(Debug, thiserror::Error)]
pub enum P11Error {
    #[error("failed to load PKCS#11 module {path}")]
    ModuleLoad {
        path: Utf8PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("PKCS#11 module does not provide {0}")]
    MissingFunction(&'static str),

    /// Transport-level fault, typically a failure to open a session.
    /// Callers may retry once the token is reachable again.
    #[error("token offline: {call} failed with CKR {rv:#06x}")]
    Offline { call: &'static str, rv: CK_RV },

    /// Non-OK return code from the native library.
    #[error("{call} failed with CKR {rv:#06x}")]
    Cryptoki { call: &'static str, rv: CK_RV },

    #[error("no {what} found for {alias:?}")]
    NotFound { what: &'static str, alias: String },

    #[error("multiple {what} objects match {needle:?}")]
    Ambiguous { what: &'static str, needle: String },

    #[error("alias {alias:?} is already in use")]
    AlreadyExists { alias: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("key authorization failed: {0}")]
    KeyAuthorization(String),

    #[error("invalid device configuration: {0}")]
    Config(String),

    #[error("certificate generation failed")]
    CertificateGenerator(#[source] anyhow::Error),
}

impl P11Error {
    /// The native return code, when this error carries one.
    pub fn return_value(&self) -> Option<CK_RV> {
        match self {
            P11Error::Offline { rv, .. } | P11Error::Cryptoki { rv, .. } => Some(*rv),
            _ => None,
        }
    }

    pub(crate) fn is_rv(&self, code: CK_RV) -> bool {
        self.return_value() == Some(code)
    }
}
