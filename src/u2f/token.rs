use std::collections::HashMap;
use std::io::Read;

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

use crate::u2f::apdu::{Request, Response, ResponseLen};
use crate::u2f::attestation::{
    authenticate_signature_base, register_signature_base, P256_SPKI_PREFIX,
};
use crate::u2f::constants::*;
use crate::u2f::error::Error;

const KEY_HANDLE_SIZE: usize = 32;

struct StoredKey {
    private_key: Vec<u8>,
    application: [u8; U2F_APPID_SIZE],
}

/// Software U2F token: registers ring-generated P-256 credentials, signs
/// authentications with a strictly incrementing counter, and answers with
/// the status words a certified device would.
pub struct SoftToken {
    attestation_key: Vec<u8>,
    attestation_cert: Vec<u8>,
    keys: HashMap<Vec<u8>, StoredKey>,
    counter: u32,
    rng: SystemRandom,
}

impl SoftToken {
    pub fn new() -> Result<Self, Error> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)?;
        let attestation_key = document.as_ref().to_vec();
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &attestation_key, &rng)?;
        let attestation_cert = attestation_certificate(pair.public_key().as_ref());

        Ok(SoftToken {
            attestation_key,
            attestation_cert,
            keys: HashMap::new(),
            counter: 0,
            rng,
        })
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn attestation_cert(&self) -> &[u8] {
        &self.attestation_cert
    }

    /// Handle one encoded request APDU and produce the encoded response,
    /// mapping malformed requests to `SW_WRONG_LENGTH` the way certified
    /// hardware reports them.
    pub fn handle_apdu(&mut self, request: &[u8]) -> Vec<u8> {
        let response = match Request::decode(request) {
            Ok(request) => self.dispatch(request),
            Err(_) => Response::from_status(U2F_SW_WRONG_LENGTH),
        };
        response.encode()
    }

    fn dispatch(&mut self, request: Request) -> Response {
        if request.cla != 0x00 {
            return Response::from_status(U2F_SW_CLA_NOT_SUPPORTED);
        }

        let result = match request.ins {
            U2F_REGISTER => self.register(&request),
            U2F_AUTHENTICATE => self.authenticate(&request),
            U2F_VERSION => self.version(&request),
            _ => Err(Error::UnexpectedStatus(U2F_SW_INS_NOT_SUPPORTED)),
        };

        match result {
            Ok(data) => {
                if let ResponseLen::Exact(expected) = request.response_len {
                    if data.len() > expected as usize {
                        return Response::from_status(U2F_SW_WRONG_LENGTH);
                    }
                }
                Response {
                    data,
                    status: U2F_SW_NO_ERROR,
                }
            }
            Err(Error::UnexpectedStatus(sw)) => Response::from_status(sw),
            Err(_) => Response::from_status(U2F_SW_WRONG_LENGTH),
        }
    }

    fn register(&mut self, request: &Request) -> Result<Vec<u8>, Error> {
        if request.data.len() != U2F_CHAL_SIZE + U2F_APPID_SIZE {
            return Err(Error::UnexpectedStatus(U2F_SW_WRONG_LENGTH));
        }

        let mut cursor = std::io::Cursor::new(&request.data);
        let mut challenge = [0u8; U2F_CHAL_SIZE];
        cursor.read_exact(&mut challenge)?;
        let mut application = [0u8; U2F_APPID_SIZE];
        cursor.read_exact(&mut application)?;

        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.rng)?;
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, document.as_ref(), &self.rng)?;

        let mut user_public_key = [0u8; U2F_EC_POINT_SIZE];
        pair.public_key().as_ref().read_exact(&mut user_public_key)?;

        let mut key_handle = vec![0u8; KEY_HANDLE_SIZE];
        self.rng.fill(&mut key_handle)?;

        let base =
            register_signature_base(&application, &challenge, &key_handle, &user_public_key);
        let attestation_pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &self.attestation_key,
            &self.rng,
        )?;
        let signature = attestation_pair.sign(&self.rng, &base)?;

        self.keys.insert(
            key_handle.clone(),
            StoredKey {
                private_key: document.as_ref().to_vec(),
                application,
            },
        );

        let mut data = Vec::with_capacity(
            1 + U2F_EC_POINT_SIZE + 1 + key_handle.len() + self.attestation_cert.len() + 72,
        );
        data.push(U2F_REGISTER_ID);
        data.extend_from_slice(&user_public_key);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(&key_handle);
        data.extend_from_slice(&self.attestation_cert);
        data.extend_from_slice(signature.as_ref());
        Ok(data)
    }

    fn authenticate(&mut self, request: &Request) -> Result<Vec<u8>, Error> {
        if request.data.len() < U2F_CHAL_SIZE + U2F_APPID_SIZE + 1 {
            return Err(Error::UnexpectedStatus(U2F_SW_WRONG_LENGTH));
        }

        let mut cursor = std::io::Cursor::new(&request.data);
        let mut challenge = [0u8; U2F_CHAL_SIZE];
        cursor.read_exact(&mut challenge)?;
        let mut application = [0u8; U2F_APPID_SIZE];
        cursor.read_exact(&mut application)?;
        let mut key_handle_len = [0u8; 1];
        cursor.read_exact(&mut key_handle_len)?;

        let key_handle = &request.data[cursor.position() as usize..];
        if key_handle.len() != key_handle_len[0] as usize {
            return Err(Error::UnexpectedStatus(U2F_SW_WRONG_LENGTH));
        }

        let stored = match self.keys.get(key_handle) {
            Some(stored) if stored.application == application => stored,
            _ => return Err(Error::UnexpectedStatus(U2F_SW_WRONG_DATA)),
        };

        match request.p1 {
            // The handle is valid for this application; a real device now
            // waits for the user, which a check-only request never gets.
            U2F_AUTH_CHECK_ONLY => Err(Error::UnexpectedStatus(U2F_SW_CONDITIONS_NOT_SATISFIED)),
            U2F_AUTH_ENFORCE | U2F_AUTH_DONT_ENFORCE => {
                let pair = EcdsaKeyPair::from_pkcs8(
                    &ECDSA_P256_SHA256_ASN1_SIGNING,
                    &stored.private_key,
                    &self.rng,
                )?;

                self.counter += 1;
                let flags = U2F_AUTH_FLAG_TUP;
                let base =
                    authenticate_signature_base(&application, flags, self.counter, &challenge);
                let signature = pair.sign(&self.rng, &base)?;

                let mut data = Vec::with_capacity(1 + U2F_CTR_SIZE + signature.as_ref().len());
                data.push(flags);
                data.extend_from_slice(&self.counter.to_be_bytes());
                data.extend_from_slice(signature.as_ref());
                Ok(data)
            }
            _ => Err(Error::UnexpectedStatus(U2F_SW_INS_NOT_SUPPORTED)),
        }
    }

    fn version(&self, request: &Request) -> Result<Vec<u8>, Error> {
        if !request.data.is_empty() {
            return Err(Error::UnexpectedStatus(U2F_SW_WRONG_LENGTH));
        }
        Ok(U2F_V2_VERSION_STR.as_bytes().to_vec())
    }
}

/// Minimal DER certificate shell around a P-256 SubjectPublicKeyInfo:
/// version marker and serial filler, then the key. Carries exactly the
/// structure the conformance parser relies on, with a long-form outer
/// length as real certificates have.
fn attestation_certificate(public_key: &[u8]) -> Vec<u8> {
    let mut body = vec![0xA0, 0x03, 0x02, 0x01, 0x02, 0x02, 0x01, 0x2A];
    body.resize(48, 0x00);
    body.extend_from_slice(&P256_SPKI_PREFIX);
    body.extend_from_slice(public_key);

    let mut cert = Vec::with_capacity(3 + body.len());
    cert.push(0x30);
    cert.push(0x81);
    cert.push(body.len() as u8);
    cert.extend_from_slice(&body);
    cert
}

#[cfg(test)]
use crate::u2f::attestation::{
    verify_authentication, verify_registration, AuthenticateResponse, RegisterResponse,
};

#[cfg(test)]
fn exchange_apdu(token: &mut SoftToken, request: &Request) -> Response {
    let encoded = request.encode(true).unwrap();
    Response::read_from(&token.handle_apdu(&encoded)).unwrap()
}

#[cfg(test)]
fn enroll(token: &mut SoftToken) -> ([u8; 32], RegisterResponse) {
    let challenge = [0x11; U2F_CHAL_SIZE];
    let application = [0x22; U2F_APPID_SIZE];
    let response = exchange_apdu(token, &Request::register(&challenge, &application));
    assert_eq!(response.status, U2F_SW_NO_ERROR);
    (application, RegisterResponse::read_from(&response.data).unwrap())
}

#[test]
fn test_version_request() {
    let mut token = SoftToken::new().unwrap();
    let response = exchange_apdu(&mut token, &Request::version());
    assert_eq!(response.status, U2F_SW_NO_ERROR);
    assert_eq!(response.data, b"U2F_V2");
}

#[test]
fn test_register_attestation_verifies() {
    let mut token = SoftToken::new().unwrap();
    let challenge = [0x5A; U2F_CHAL_SIZE];
    let application = [0xC3; U2F_APPID_SIZE];

    let response = exchange_apdu(&mut token, &Request::register(&challenge, &application));
    assert_eq!(response.status, U2F_SW_NO_ERROR);

    let registration = RegisterResponse::read_from(&response.data).unwrap();
    verify_registration(&application, &challenge, &registration).unwrap();
}

#[test]
fn test_register_attestation_rejects_any_corruption() {
    let mut token = SoftToken::new().unwrap();
    let challenge = [0x5A; U2F_CHAL_SIZE];
    let application = [0xC3; U2F_APPID_SIZE];

    let response = exchange_apdu(&mut token, &Request::register(&challenge, &application));
    let registration = RegisterResponse::read_from(&response.data).unwrap();

    // Flipping a signature bit, the application or the challenge must all
    // break verification.
    let mut corrupt = registration.clone();
    let last = corrupt.signature.len() - 1;
    corrupt.signature[last] ^= 0x01;
    match verify_registration(&application, &challenge, &corrupt) {
        Err(Error::VerificationFailed) => {}
        other => panic!("expected VerificationFailed, got {:?}", other),
    }

    let mut application_bad = application;
    application_bad[0] ^= 0x01;
    match verify_registration(&application_bad, &challenge, &registration) {
        Err(Error::VerificationFailed) => {}
        other => panic!("expected VerificationFailed, got {:?}", other),
    }

    let mut challenge_bad = challenge;
    challenge_bad[31] ^= 0x80;
    match verify_registration(&application, &challenge_bad, &registration) {
        Err(Error::VerificationFailed) => {}
        other => panic!("expected VerificationFailed, got {:?}", other),
    }
}

#[test]
fn test_authenticate_signs_and_counts() {
    let mut token = SoftToken::new().unwrap();
    let (application, registration) = enroll(&mut token);
    let challenge = [0x77; U2F_CHAL_SIZE];

    let request = Request::authenticate(
        U2F_AUTH_ENFORCE,
        &challenge,
        &application,
        &registration.key_handle,
    );
    let response = exchange_apdu(&mut token, &request);
    assert_eq!(response.status, U2F_SW_NO_ERROR);

    let assertion = AuthenticateResponse::read_from(&response.data).unwrap();
    assert!(assertion.user_presence());
    assert_eq!(assertion.counter, 1);
    verify_authentication(&application, &challenge, &assertion, &registration.user_public_key)
        .unwrap();

    // The counter increments by exactly one per signature.
    let response = exchange_apdu(&mut token, &request);
    let assertion = AuthenticateResponse::read_from(&response.data).unwrap();
    assert_eq!(assertion.counter, 2);
}

#[test]
fn test_authenticate_check_only_and_wrong_data() {
    let mut token = SoftToken::new().unwrap();
    let (application, registration) = enroll(&mut token);
    let challenge = [0x77; U2F_CHAL_SIZE];

    let check = Request::authenticate(
        U2F_AUTH_CHECK_ONLY,
        &challenge,
        &application,
        &registration.key_handle,
    );
    assert_eq!(exchange_apdu(&mut token, &check).status, U2F_SW_CONDITIONS_NOT_SATISFIED);

    let mut bad_handle = registration.key_handle.clone();
    bad_handle[0] ^= 0x55;
    let request = Request::authenticate(U2F_AUTH_ENFORCE, &challenge, &application, &bad_handle);
    assert_eq!(exchange_apdu(&mut token, &request).status, U2F_SW_WRONG_DATA);

    let mut bad_application = application;
    bad_application[0] ^= 0xAA;
    let request = Request::authenticate(
        U2F_AUTH_ENFORCE,
        &challenge,
        &bad_application,
        &registration.key_handle,
    );
    assert_eq!(exchange_apdu(&mut token, &request).status, U2F_SW_WRONG_DATA);
}

#[test]
fn test_status_words_for_bad_requests() {
    let mut token = SoftToken::new().unwrap();

    let mut bad_cla = Request::version();
    bad_cla.cla = 0x01;
    assert_eq!(exchange_apdu(&mut token, &bad_cla).status, U2F_SW_CLA_NOT_SUPPORTED);

    let unknown_ins = Request::new(0x00, 0x00, 0x00, 0x00, Vec::new(), ResponseLen::Any);
    assert_eq!(exchange_apdu(&mut token, &unknown_ins).status, U2F_SW_INS_NOT_SUPPORTED);

    // Version answers six data bytes; asking for at most two must fail.
    let mut short_le = Request::version();
    short_le.response_len = ResponseLen::Exact(2);
    assert_eq!(exchange_apdu(&mut token, &short_le).status, U2F_SW_WRONG_LENGTH);

    let mut version_with_body = Request::version();
    version_with_body.data = vec![0x01, 0x02, 0x03];
    assert_eq!(exchange_apdu(&mut token, &version_with_body).status, U2F_SW_WRONG_LENGTH);

    let register_short = Request::new(0x00, U2F_REGISTER, 0x00, 0x00, vec![0x00; 16], ResponseLen::Any);
    assert_eq!(exchange_apdu(&mut token, &register_short).status, U2F_SW_WRONG_LENGTH);
}

#[test]
fn test_attestation_certificate_shape() {
    let token = SoftToken::new().unwrap();
    let cert = token.attestation_cert();
    assert_eq!(cert[0], 0x30);
    assert_eq!(cert[1], 0x81);
    assert_eq!(cert[2] as usize, cert.len() - 3);
    assert!(cert
        .windows(P256_SPKI_PREFIX.len())
        .any(|window| window == P256_SPKI_PREFIX));
}
