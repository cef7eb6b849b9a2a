use thiserror::Error;

/// The feed could not be retrieved this cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("feed returned an empty body")]
    Empty,
    #[error("fetch failed: {0}")]
    Other(String),
}

/// The fetched document as a whole could not be read as a feed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is neither RSS ({rss}) nor Atom ({atom})")]
    UnknownFormat { rss: String, atom: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("feed parsing error: {0}")]
    Parse(#[from] ParseError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("poller task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed server message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}
