use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid image reference: {0}")]
    ImageParse(String),

    #[error("invalid workload id: {0}")]
    WorkloadParse(String),

    #[error("a release is already in progress; please try again later")]
    ReleaseInProgress,

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("not cached")]
    NotCached,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is a transient cancellation or deadline failure.
    /// The warmer suppresses logging for these to avoid drowning the log
    /// in expected timeouts.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout(),
            Error::Registry(msg) => {
                msg.contains("deadline exceeded")
                    || msg.contains("request canceled")
                    || msg.contains("operation timed out")
            }
            _ => false,
        }
    }
}
