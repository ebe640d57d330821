use std::borrow::Cow;

/// All possible error kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required setting is missing or malformed.
    ///
    /// Only raised at startup, before any remote call is issued.
    Configuration,
    /// The request could not reach the remote registry, or it timed out.
    Request,
    /// The remote registry answered with a non-successful status code.
    Remote,
    /// A response body could not be decoded.
    JsonResponse,
    /// A device command could not be built or is too large.
    Command,
    /// A deferred job could not be queued.
    Dispatch,
    /// A device list could not be ingested.
    Ingestion,
    /// The telemetry stream session failed.
    StreamSession,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Configuration => "Configuration",
            Self::Request => "Request",
            Self::Remote => "Remote Registry",
            Self::JsonResponse => "Json Response",
            Self::Command => "Device Command",
            Self::Dispatch => "Dispatch",
            Self::Ingestion => "Ingestion",
            Self::StreamSession => "Stream Session",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A library error.
///
/// It carries an [`ErrorKind`], a description of the failure and, for
/// errors produced by the remote registry, the returned status code.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
    status: Option<u16>,
}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
            status: None,
        }
    }

    /// Creates a [`ErrorKind::Remote`] error from a status code and the
    /// response body returned by the remote registry.
    pub fn remote(status: u16, body: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: ErrorKind::Remote,
            description: body.into(),
            status: Some(status),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the status code answered by the remote registry, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub(crate) fn configuration(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Configuration, description)
    }

    pub(crate) fn stream_session(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::StreamSession, description)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({status}): {}", self.kind, self.description),
            None => write!(f, "{}: {}", self.kind, self.description),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::new(ErrorKind::JsonResponse, format!("Json error caused by {e}"));
        }
        Self::new(ErrorKind::Request, e.to_string())
    }
}

impl From<rumqttc::v5::ClientError> for Error {
    fn from(e: rumqttc::v5::ClientError) -> Self {
        Self::stream_session(e.to_string())
    }
}

impl From<rumqttc::v5::ConnectionError> for Error {
    fn from(e: rumqttc::v5::ConnectionError) -> Self {
        Self::stream_session(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Command, format!("Unable to serialize the command: {e}"))
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
