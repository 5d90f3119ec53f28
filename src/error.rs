use std::convert::From;
use std::error::Error as StdError;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    DatabaseError(rusqlite::Error),
    ScanBusy,
    Unreachable,
    ProtocolError(String),
    OtherError,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Error {
        Error::DatabaseError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::ProtocolError(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::IoError(ref e) => write!(f, "{}", e),
            Error::DatabaseError(ref e) => write!(f, "{}", e),
            Error::ScanBusy => write!(f, "scan already running"),
            Error::Unreachable => write!(f, "node unreachable"),
            Error::ProtocolError(ref s) => write!(f, "protocol error: {}", s),
            Error::OtherError => write!(f, "other error"),
        }
    }
}

impl StdError for Error {
    fn description(&self) -> &str {
        match *self {
            Error::IoError(..) => "io error",
            Error::DatabaseError(..) => "database error",
            Error::ScanBusy => "scan already running",
            Error::Unreachable => "node unreachable",
            Error::ProtocolError(..) => "protocol error",
            Error::OtherError => "other error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
