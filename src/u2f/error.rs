use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io::Error as IoError;

use ring::error::{KeyRejected, Unspecified};

#[derive(Debug)]
pub enum Error {
    Io(IoError),
    Truncated,
    DataTooLong,
    MalformedApdu(String),
    MalformedResponse(String),
    MalformedCertificate(String),
    MalformedSignature(String),
    KeyNotFound,
    VerificationFailed,
    KeyRejected(KeyRejected),
    UnexpectedStatus(u16),
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<Unspecified> for Error {
    fn from(_: Unspecified) -> Self {
        Error::VerificationFailed
    }
}

impl From<KeyRejected> for Error {
    fn from(e: KeyRejected) -> Self {
        Error::KeyRejected(e)
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use Error::*;
        match self {
            Io(io_e) => io_e.fmt(f),
            Truncated => write!(f, "Reply too short to carry a status word"),
            DataTooLong => write!(f, "Request data does not fit in a 16-bit length"),
            MalformedApdu(s) => write!(f, "Malformed APDU: {}", s),
            MalformedResponse(s) => write!(f, "Malformed response: {}", s),
            MalformedCertificate(s) => write!(f, "Malformed attestation certificate: {}", s),
            MalformedSignature(s) => write!(f, "Malformed signature: {}", s),
            KeyNotFound => write!(f, "P-256 subject public key not found in certificate"),
            VerificationFailed => write!(f, "Signature verification failed"),
            KeyRejected(e) => write!(f, "Key rejected: {}", e),
            UnexpectedStatus(sw) => write!(f, "Unexpected status word 0x{:04X}", sw),
        }
    }
}
