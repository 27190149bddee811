use crate::cache::errors::FetchError;
use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Fetch(FetchError),

    #[from]
    Json(serde_json::Error),

    #[from]
    Http(reqwest::Error),

    #[from]
    Io(std::io::Error),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Fetch(e) => write!(fmt, "{e}"),
            Self::Json(e) => write!(fmt, "json: {e}"),
            Self::Http(e) => write!(fmt, "http: {e}"),
            Self::Io(e) => write!(fmt, "io: {e}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}
