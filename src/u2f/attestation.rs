use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use sha2::{Digest, Sha256};

use crate::u2f::constants::*;
use crate::u2f::error::Error;

/// ASN.1 lead-in of a P-256 SubjectPublicKeyInfo, up to and including the
/// BIT STRING header. The 65-byte uncompressed point follows it directly.
pub const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x08,
    0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// Parsed `U2F_REGISTER` response data (status word already stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub user_public_key: [u8; U2F_EC_POINT_SIZE],
    pub key_handle: Vec<u8>,
    pub attestation_cert: Vec<u8>,
    pub signature: Vec<u8>,
}

impl RegisterResponse {
    pub fn read_from(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);

        let reserved = cursor.read_u8()?;
        if reserved != U2F_REGISTER_ID {
            return Err(Error::MalformedResponse(format!(
                "unexpected registration id 0x{:02X}",
                reserved
            )));
        }

        let mut user_public_key = [0u8; U2F_EC_POINT_SIZE];
        cursor.read_exact(&mut user_public_key)?;
        if user_public_key[0] != U2F_POINT_UNCOMPRESSED {
            return Err(Error::MalformedResponse(format!(
                "unexpected point format 0x{:02X}",
                user_public_key[0]
            )));
        }

        let key_handle_len = cursor.read_u8()? as usize;
        if key_handle_len > U2F_MAX_KH_SIZE {
            return Err(Error::MalformedResponse(format!(
                "key handle of {} bytes",
                key_handle_len
            )));
        }
        let mut key_handle = vec![0u8; key_handle_len];
        cursor.read_exact(&mut key_handle)?;

        // Certificate and signature sit back to back with no length prefix;
        // both are delimited by their own DER headers.
        let tail = &data[cursor.position() as usize..];
        let (cert, rest) = certificate(tail)?;
        if cert.len() > U2F_MAX_ATT_CERT_SIZE {
            return Err(Error::MalformedCertificate(format!(
                "certificate of {} bytes",
                cert.len()
            )));
        }
        let sig = signature(rest)?;

        Ok(RegisterResponse {
            user_public_key,
            key_handle,
            attestation_cert: cert.to_vec(),
            signature: sig.to_vec(),
        })
    }
}

/// Parsed `U2F_AUTHENTICATE` response data (status word already stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub flags: u8,
    pub counter: u32,
    pub signature: Vec<u8>,
}

impl AuthenticateResponse {
    pub fn read_from(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u8()?;
        let counter = cursor.read_u32::<BigEndian>()?;
        let sig = signature(&data[cursor.position() as usize..])?;

        Ok(AuthenticateResponse {
            flags,
            counter,
            signature: sig.to_vec(),
        })
    }

    pub fn user_presence(&self) -> bool {
        self.flags & U2F_AUTH_FLAG_TUP != 0
    }
}

/// Split the attestation certificate off `tail`, delimiting it by its DER
/// length. Certificates are always long enough for the long-form length
/// encodings, so only the 0x81/0x82 forms are accepted.
pub fn certificate(tail: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    if tail.len() < 4 {
        return Err(Error::MalformedCertificate("not enough bytes for a DER header".to_string()));
    }
    if tail[0] != 0x30 {
        return Err(Error::MalformedCertificate(format!(
            "expected a DER SEQUENCE, got tag 0x{:02X}",
            tail[0]
        )));
    }

    let (length, header_len) = match tail[1] {
        0x81 => (tail[2] as usize, 3),
        0x82 => ((tail[2] as usize) << 8 | tail[3] as usize, 4),
        other => {
            return Err(Error::MalformedCertificate(format!(
                "unsupported DER length byte 0x{:02X}",
                other
            )))
        }
    };

    let total = header_len + length;
    if total > tail.len() {
        return Err(Error::MalformedCertificate("certificate truncated".to_string()));
    }

    Ok(tail.split_at(total))
}

/// Delimit a DER ECDSA signature at the start of `tail`. Signatures over
/// P-256 stay well below 128 bytes, so only the single-byte length form is
/// accepted.
pub fn signature(tail: &[u8]) -> Result<&[u8], Error> {
    if tail.len() < 2 {
        return Err(Error::MalformedSignature("not enough bytes for a DER header".to_string()));
    }
    if tail[0] != 0x30 {
        return Err(Error::MalformedSignature(format!(
            "expected a DER SEQUENCE, got tag 0x{:02X}",
            tail[0]
        )));
    }
    if tail[1] & 0x80 != 0 {
        return Err(Error::MalformedSignature("long-form signature length".to_string()));
    }

    let length = tail[1] as usize;
    if 2 + length > tail.len() {
        return Err(Error::MalformedSignature("signature truncated".to_string()));
    }

    Ok(&tail[..2 + length])
}

/// The attested P-256 public key, located by searching the certificate for
/// the SubjectPublicKeyInfo lead-in rather than walking the full X.509
/// structure.
pub fn subject_public_key(cert: &[u8]) -> Result<[u8; U2F_EC_POINT_SIZE], Error> {
    let offset = cert
        .windows(P256_SPKI_PREFIX.len())
        .position(|window| window == P256_SPKI_PREFIX)
        .ok_or(Error::KeyNotFound)?;

    let start = offset + P256_SPKI_PREFIX.len();
    if start + U2F_EC_POINT_SIZE > cert.len() {
        return Err(Error::KeyNotFound);
    }

    let mut public_key = [0u8; U2F_EC_POINT_SIZE];
    public_key.copy_from_slice(&cert[start..start + U2F_EC_POINT_SIZE]);
    Ok(public_key)
}

/// Signature base of a registration: `0x00 || application || challenge ||
/// key handle || user public key`, with the public key taken as the raw
/// 65-byte block of the response.
pub fn register_signature_base(
    application: &[u8; U2F_APPID_SIZE],
    challenge: &[u8; U2F_CHAL_SIZE],
    key_handle: &[u8],
    user_public_key: &[u8; U2F_EC_POINT_SIZE],
) -> Vec<u8> {
    let mut base =
        Vec::with_capacity(1 + U2F_APPID_SIZE + U2F_CHAL_SIZE + key_handle.len() + U2F_EC_POINT_SIZE);
    base.push(U2F_REGISTER_HASH_ID);
    base.extend_from_slice(application);
    base.extend_from_slice(challenge);
    base.extend_from_slice(key_handle);
    base.extend_from_slice(user_public_key);
    base
}

/// Signature base of an authentication: `application || flags ||
/// counter (big-endian) || challenge`.
pub fn authenticate_signature_base(
    application: &[u8; U2F_APPID_SIZE],
    flags: u8,
    counter: u32,
    challenge: &[u8; U2F_CHAL_SIZE],
) -> Vec<u8> {
    let mut base = Vec::with_capacity(U2F_APPID_SIZE + 1 + U2F_CTR_SIZE + U2F_CHAL_SIZE);
    base.extend_from_slice(application);
    base.push(flags);
    base.extend_from_slice(&counter.to_be_bytes());
    base.extend_from_slice(challenge);
    base
}

/// ECDSA-P256/SHA-256 verification of a DER signature over `message`.
pub fn verify_p256(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), Error> {
    UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, public_key)
        .verify(message, signature)
        .map_err(|_| Error::VerificationFailed)
}

/// Verify the attestation signature of a registration against the key
/// carried in the attestation certificate.
pub fn verify_registration(
    application: &[u8; U2F_APPID_SIZE],
    challenge: &[u8; U2F_CHAL_SIZE],
    response: &RegisterResponse,
) -> Result<(), Error> {
    let attestation_key = subject_public_key(&response.attestation_cert)?;
    let message = register_signature_base(
        application,
        challenge,
        &response.key_handle,
        &response.user_public_key,
    );
    log::debug!(
        "register signature base digest: {}",
        hex::encode(Sha256::digest(&message))
    );
    verify_p256(&attestation_key, &message, &response.signature)
}

/// Verify an authentication signature against the credential key returned
/// at registration.
pub fn verify_authentication(
    application: &[u8; U2F_APPID_SIZE],
    challenge: &[u8; U2F_CHAL_SIZE],
    response: &AuthenticateResponse,
    user_public_key: &[u8],
) -> Result<(), Error> {
    let message =
        authenticate_signature_base(application, response.flags, response.counter, challenge);
    log::debug!(
        "authenticate signature base digest: {}",
        hex::encode(Sha256::digest(&message))
    );
    verify_p256(user_public_key, &message, &response.signature)
}

/// Largest possible authenticate response data: flags, counter and a
/// maximum-size DER signature. The exact-length encoding scenarios request
/// this many bytes instead of hard-coding the sum.
pub const fn max_authenticate_response_len() -> usize {
    1 + U2F_CTR_SIZE + U2F_MAX_EC_SIG_SIZE
}

#[cfg(test)]
fn fake_certificate(length_form: u8, public_key: &[u8]) -> Vec<u8> {
    // Version marker, a serial-ish filler, then the SubjectPublicKeyInfo.
    let mut body = vec![0xA0, 0x03, 0x02, 0x01, 0x02];
    body.extend_from_slice(&[0x02, 0x01, 0x2A]);
    body.resize(40, 0x00);
    body.extend_from_slice(&P256_SPKI_PREFIX);
    body.extend_from_slice(public_key);

    let mut cert = vec![0x30];
    match length_form {
        0x81 => {
            cert.push(0x81);
            cert.push(body.len() as u8);
        }
        0x82 => {
            cert.push(0x82);
            cert.push((body.len() >> 8) as u8);
            cert.push(body.len() as u8);
        }
        _ => panic!("unsupported length form"),
    }
    cert.extend_from_slice(&body);
    cert
}

#[test]
fn test_certificate_delimiting() {
    let pk = [0x04; U2F_EC_POINT_SIZE];
    for &form in &[0x81u8, 0x82] {
        let mut tail = fake_certificate(form, &pk);
        let cert_len = tail.len();
        tail.extend_from_slice(&[0x30, 0x02, 0xAA, 0xBB]);

        let (cert, rest) = certificate(&tail).unwrap();
        assert_eq!(cert.len(), cert_len);
        assert_eq!(rest, &[0x30, 0x02, 0xAA, 0xBB]);
    }
}

#[test]
fn test_certificate_rejects_other_length_forms() {
    // Short-form DER length never appears on real certificates.
    match certificate(&[0x30, 0x45, 0x00, 0x00]) {
        Err(Error::MalformedCertificate(_)) => {}
        other => panic!("expected MalformedCertificate, got {:?}", other),
    }
    match certificate(&[0x31, 0x81, 0x02, 0x00]) {
        Err(Error::MalformedCertificate(_)) => {}
        other => panic!("expected MalformedCertificate, got {:?}", other),
    }
    match certificate(&[0x30, 0x81, 0xFF, 0x00]) {
        Err(Error::MalformedCertificate(_)) => {}
        other => panic!("expected MalformedCertificate, got {:?}", other),
    }
}

#[test]
fn test_signature_delimiting() {
    let mut tail = vec![0x30, 0x04, 0x01, 0x02, 0x03, 0x04];
    tail.extend_from_slice(&[0xDE, 0xAD]);
    assert_eq!(signature(&tail).unwrap(), &[0x30, 0x04, 0x01, 0x02, 0x03, 0x04]);

    match signature(&[0x30, 0x81, 0x02, 0x00, 0x00]) {
        Err(Error::MalformedSignature(_)) => {}
        other => panic!("expected MalformedSignature, got {:?}", other),
    }
    match signature(&[0x30, 0x10, 0x00]) {
        Err(Error::MalformedSignature(_)) => {}
        other => panic!("expected MalformedSignature, got {:?}", other),
    }
}

#[test]
fn test_subject_public_key_search() {
    let mut pk = [0u8; U2F_EC_POINT_SIZE];
    pk[0] = U2F_POINT_UNCOMPRESSED;
    pk[1] = 0x7E;
    pk[64] = 0x55;

    let cert = fake_certificate(0x81, &pk);
    assert_eq!(subject_public_key(&cert).unwrap(), pk);

    // No SubjectPublicKeyInfo lead-in at all.
    match subject_public_key(&[0x30, 0x81, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05]) {
        Err(Error::KeyNotFound) => {}
        other => panic!("expected KeyNotFound, got {:?}", other),
    }

    // Lead-in present but the point is cut off.
    let mut truncated = fake_certificate(0x81, &pk);
    truncated.truncate(truncated.len() - 8);
    match subject_public_key(&truncated) {
        Err(Error::KeyNotFound) => {}
        other => panic!("expected KeyNotFound, got {:?}", other),
    }
}

#[test]
fn test_register_response_parsing() {
    let mut pk = [0u8; U2F_EC_POINT_SIZE];
    pk[0] = U2F_POINT_UNCOMPRESSED;
    let cert = fake_certificate(0x81, &pk);

    let mut data = vec![U2F_REGISTER_ID];
    data.extend_from_slice(&pk);
    data.push(4);
    data.extend_from_slice(&[0x10, 0x20, 0x30, 0x40]);
    data.extend_from_slice(&cert);
    data.extend_from_slice(&[0x30, 0x02, 0xAA, 0xBB]);

    let parsed = RegisterResponse::read_from(&data).unwrap();
    assert_eq!(parsed.user_public_key, pk);
    assert_eq!(parsed.key_handle, vec![0x10, 0x20, 0x30, 0x40]);
    assert_eq!(parsed.attestation_cert, cert);
    assert_eq!(parsed.signature, vec![0x30, 0x02, 0xAA, 0xBB]);

    // A response that does not lead with the registration id is rejected.
    data[0] = 0x06;
    match RegisterResponse::read_from(&data) {
        Err(Error::MalformedResponse(_)) => {}
        other => panic!("expected MalformedResponse, got {:?}", other),
    }
}

#[test]
fn test_authenticate_response_parsing() {
    let mut data = vec![0x01];
    data.extend_from_slice(&0x01020304u32.to_be_bytes());
    data.extend_from_slice(&[0x30, 0x02, 0x01, 0x02]);

    let parsed = AuthenticateResponse::read_from(&data).unwrap();
    assert!(parsed.user_presence());
    assert_eq!(parsed.counter, 0x01020304);
    assert_eq!(parsed.signature, vec![0x30, 0x02, 0x01, 0x02]);
}

#[test]
fn test_signature_bases() {
    let application = [0xAA; U2F_APPID_SIZE];
    let challenge = [0xBB; U2F_CHAL_SIZE];
    let key_handle = [0xCC; 8];
    let public_key = [0xDD; U2F_EC_POINT_SIZE];

    let base = register_signature_base(&application, &challenge, &key_handle, &public_key);
    assert_eq!(base.len(), 1 + 32 + 32 + 8 + 65);
    assert_eq!(base[0], 0x00);
    assert_eq!(&base[1..33], &application);
    assert_eq!(&base[33..65], &challenge);
    assert_eq!(&base[65..73], &key_handle);
    assert_eq!(&base[73..], &public_key);

    let base = authenticate_signature_base(&application, 0x01, 7, &challenge);
    assert_eq!(base.len(), 32 + 1 + 4 + 32);
    assert_eq!(base[32], 0x01);
    assert_eq!(&base[33..37], &[0x00, 0x00, 0x00, 0x07]);
    assert_eq!(&base[37..], &challenge);
}
