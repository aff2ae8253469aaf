use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io::Error as IoError;

/// Failure of a framed exchange with the device.
#[derive(Debug)]
pub enum TransportError {
    Io(IoError),
    Timeout,
    BadReply(String),
    BadSequence,
    BufferTooSmall,
    ReplyTooLong,
    RequestTooLong,
    InvalidControlPointLength(u32),
}

impl From<IoError> for TransportError {
    fn from(e: IoError) -> Self {
        TransportError::Io(e)
    }
}

impl StdError for TransportError {}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use TransportError::*;
        match self {
            Io(io_e) => io_e.fmt(f),
            Timeout => write!(f, "Timed out waiting for the device reply"),
            BadReply(s) => write!(f, "{}", s),
            BadSequence => write!(f, "Continuation frame out of sequence"),
            BufferTooSmall => write!(f, "Reply larger than the reply buffer"),
            ReplyTooLong => write!(f, "Frame carries more data than the declared reply length"),
            RequestTooLong => write!(f, "Request payload does not fit in a 16-bit length"),
            InvalidControlPointLength(l) => write!(f, "Control point length {} outside [20, 512]", l),
        }
    }
}

/// Failure while classifying an advertisement snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum AdvertisementError {
    MissingFlags,
    Truncated,
}

impl StdError for AdvertisementError {}

impl Display for AdvertisementError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        match self {
            AdvertisementError::MissingFlags => write!(f, "Advertisement has no Flags section"),
            AdvertisementError::Truncated => write!(f, "Advertisement section list is truncated"),
        }
    }
}
