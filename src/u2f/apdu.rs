use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::u2f::constants::*;
use crate::u2f::error::Error;

/// Expected-response-length (Le) field of a request APDU.
///
/// `Any` is the degenerate encoding (`0x00` short, `0x00 0x00` extended)
/// asking for up to the encoding maximum; `Exact(n)` requests at most `n`
/// response data bytes and makes the device fail with `SW_WRONG_LENGTH`
/// when its response would not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLen {
    Absent,
    Any,
    Exact(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub response_len: ResponseLen,
}

impl Request {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, response_len: ResponseLen) -> Self {
        Request {
            cla,
            ins,
            p1,
            p2,
            data,
            response_len,
        }
    }

    /// `U2F_VERSION` request.
    pub fn version() -> Self {
        Request::new(0x00, U2F_VERSION, 0x00, 0x00, Vec::new(), ResponseLen::Any)
    }

    /// `U2F_REGISTER` request over a challenge and application parameter.
    pub fn register(challenge: &[u8; U2F_CHAL_SIZE], application: &[u8; U2F_APPID_SIZE]) -> Self {
        let mut data = Vec::with_capacity(U2F_CHAL_SIZE + U2F_APPID_SIZE);
        data.extend_from_slice(challenge);
        data.extend_from_slice(application);
        Request::new(0x00, U2F_REGISTER, 0x00, 0x00, data, ResponseLen::Any)
    }

    /// `U2F_AUTHENTICATE` request with the given control byte.
    pub fn authenticate(
        control: u8,
        challenge: &[u8; U2F_CHAL_SIZE],
        application: &[u8; U2F_APPID_SIZE],
        key_handle: &[u8],
    ) -> Self {
        let mut data = Vec::with_capacity(U2F_CHAL_SIZE + U2F_APPID_SIZE + 1 + key_handle.len());
        data.extend_from_slice(challenge);
        data.extend_from_slice(application);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(key_handle);
        Request::new(0x00, U2F_AUTHENTICATE, control, 0x00, data, ResponseLen::Any)
    }

    /// Serialize, choosing the short encoding unless the data or the
    /// requested response length require the extended one, or the caller
    /// forces it.
    pub fn encode(&self, force_extended: bool) -> Result<Vec<u8>, Error> {
        if self.data.len() > MAX_RESPONSE_LEN_EXTENDED - 1 {
            return Err(Error::DataTooLong);
        }

        let extended = force_extended
            || self.data.len() >= MAX_RESPONSE_LEN_SHORT
            || matches!(self.response_len, ResponseLen::Exact(n) if n as usize >= MAX_RESPONSE_LEN_SHORT);

        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);

        if !self.data.is_empty() {
            if extended {
                out.push(0x00);
                out.push((self.data.len() >> 8) as u8);
                out.push(self.data.len() as u8);
            } else {
                out.push(self.data.len() as u8);
            }
            out.extend_from_slice(&self.data);
        }

        match self.response_len {
            ResponseLen::Absent => {}
            ResponseLen::Any => {
                if extended {
                    if self.data.is_empty() {
                        out.push(0x00);
                    }
                    out.push(0x00);
                    out.push(0x00);
                } else {
                    out.push(0x00);
                }
            }
            ResponseLen::Exact(n) => {
                if extended {
                    if self.data.is_empty() {
                        out.push(0x00);
                    }
                    out.push((n >> 8) as u8);
                    out.push(n as u8);
                } else {
                    out.push(n as u8);
                }
            }
        }

        Ok(out)
    }

    /// Parse a serialized request, disambiguating the short and extended
    /// length encodings from the field layout alone.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(bytes);
        let cla = reader.read_u8()?;
        let ins = reader.read_u8()?;
        let p1 = reader.read_u8()?;
        let p2 = reader.read_u8()?;

        let body = &bytes[4..];
        let (data, response_len) = match body.len() {
            0 => (Vec::new(), ResponseLen::Absent),
            1 => (Vec::new(), Self::short_le(body[0])),
            _ if body[0] == 0x00 => {
                // Extended encoding.
                if body.len() < 3 {
                    return Err(Error::MalformedApdu("truncated extended length".to_string()));
                }
                if body.len() == 3 {
                    (Vec::new(), Self::extended_le(BigEndian::read_u16(&body[1..3])))
                } else {
                    let lc = BigEndian::read_u16(&body[1..3]) as usize;
                    if body.len() < 3 + lc {
                        return Err(Error::MalformedApdu("request data shorter than Lc".to_string()));
                    }
                    let data = body[3..3 + lc].to_vec();
                    let response_len = match body.len() - 3 - lc {
                        0 => ResponseLen::Absent,
                        2 => Self::extended_le(BigEndian::read_u16(&body[3 + lc..])),
                        _ => {
                            return Err(Error::MalformedApdu(
                                "trailing bytes after request data".to_string(),
                            ))
                        }
                    };
                    (data, response_len)
                }
            }
            _ => {
                // Short encoding.
                let lc = body[0] as usize;
                if body.len() < 1 + lc {
                    return Err(Error::MalformedApdu("request data shorter than Lc".to_string()));
                }
                let data = body[1..1 + lc].to_vec();
                let response_len = match body.len() - 1 - lc {
                    0 => ResponseLen::Absent,
                    1 => Self::short_le(body[1 + lc]),
                    _ => {
                        return Err(Error::MalformedApdu(
                            "trailing bytes after request data".to_string(),
                        ))
                    }
                };
                (data, response_len)
            }
        };

        Ok(Request {
            cla,
            ins,
            p1,
            p2,
            data,
            response_len,
        })
    }

    fn short_le(le: u8) -> ResponseLen {
        if le == 0x00 {
            ResponseLen::Any
        } else {
            ResponseLen::Exact(le as u16)
        }
    }

    fn extended_le(le: u16) -> ResponseLen {
        if le == 0x0000 {
            ResponseLen::Any
        } else {
            ResponseLen::Exact(le)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: u16,
}

impl Response {
    pub fn from_status(status: u16) -> Self {
        Response {
            data: Vec::new(),
            status,
        }
    }

    pub fn read_from(reply: &[u8]) -> Result<Self, Error> {
        let (data, status) = decode_status_word(reply)?;
        Ok(Response {
            data: data.to_vec(),
            status,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push((self.status >> 8) as u8);
        out.push(self.status as u8);
        out
    }

    pub fn is_success(&self) -> bool {
        self.status == U2F_SW_NO_ERROR
    }
}

/// Split a reply into its data and trailing big-endian status word.
pub fn decode_status_word(reply: &[u8]) -> Result<(&[u8], u16), Error> {
    if reply.len() < 2 {
        return Err(Error::Truncated);
    }
    let (data, sw) = reply.split_at(reply.len() - 2);
    Ok((data, BigEndian::read_u16(sw)))
}

#[test]
fn test_encode_version_short_any() {
    let bytes = Request::version().encode(false).unwrap();
    assert_eq!(bytes, vec![0x00, 0x03, 0x00, 0x00, 0x00]);
}

#[test]
fn test_encode_version_extended_any() {
    let bytes = Request::version().encode(true).unwrap();
    assert_eq!(bytes, vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_encode_version_exact_lengths() {
    let mut req = Request::version();
    req.response_len = ResponseLen::Exact(6);
    assert_eq!(req.encode(false).unwrap(), vec![0x00, 0x03, 0x00, 0x00, 0x06]);
    assert_eq!(
        req.encode(true).unwrap(),
        vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x06]
    );
}

#[test]
fn test_encode_short_with_data_and_le() {
    let req = Request::new(
        0x00,
        U2F_REGISTER,
        0x00,
        0x00,
        vec![0xAA, 0xBB, 0xCC],
        ResponseLen::Exact(16),
    );
    assert_eq!(
        req.encode(false).unwrap(),
        vec![0x00, 0x01, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x10]
    );
}

#[test]
fn test_encode_large_data_switches_to_extended() {
    let req = Request::new(0x00, 0x01, 0x00, 0x00, vec![0x42; 300], ResponseLen::Any);
    let bytes = req.encode(false).unwrap();
    assert_eq!(&bytes[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x2C]);
    assert_eq!(bytes.len(), 7 + 300 + 2);
    assert_eq!(&bytes[307..], &[0x00, 0x00]);
}

#[test]
fn test_encode_large_exact_le_switches_to_extended() {
    let mut req = Request::version();
    req.response_len = ResponseLen::Exact(1024);
    assert_eq!(
        req.encode(false).unwrap(),
        vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00]
    );
}

#[test]
fn test_decode_round_trips() {
    let samples = vec![
        Request::version(),
        Request::register(&[0x11; 32], &[0x22; 32]),
        Request::authenticate(U2F_AUTH_ENFORCE, &[0x11; 32], &[0x22; 32], &[0x33; 64]),
        Request::new(0x00, 0x01, 0x00, 0x00, vec![0x42; 300], ResponseLen::Exact(999)),
        Request::new(0x00, 0x03, 0x00, 0x00, Vec::new(), ResponseLen::Absent),
        Request::new(0x00, 0x02, 0x03, 0x00, vec![0x07; 10], ResponseLen::Exact(8)),
    ];
    for req in samples {
        for &force in &[false, true] {
            let decoded = Request::decode(&req.encode(force).unwrap()).unwrap();
            assert_eq!(decoded, req);
        }
    }
}

#[test]
fn test_decode_rejects_trailing_garbage() {
    // A version request with three stray bytes after the length fields.
    let bytes = [0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03];
    match Request::decode(&bytes) {
        Err(Error::MalformedApdu(_)) => {}
        other => panic!("expected MalformedApdu, got {:?}", other),
    }
}

#[test]
fn test_decode_status_word() {
    let mut reply = b"U2F_V2".to_vec();
    reply.extend_from_slice(&[0x90, 0x00]);
    let (data, sw) = decode_status_word(&reply).unwrap();
    assert_eq!(data, b"U2F_V2");
    assert_eq!(sw, 0x9000);
}

#[test]
fn test_decode_status_word_truncated() {
    match decode_status_word(&[0x90]) {
        Err(Error::Truncated) => {}
        other => panic!("expected Truncated, got {:?}", other),
    }
}
