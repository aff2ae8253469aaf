//! U2F message-level conformance scenarios: version and error status words,
//! short/extended length encodings, enroll with attestation verification and
//! sign with counter checks.

use std::time::Instant;

use crate::ble::constants::*;
use crate::ble::transport::{BleConnection, BleTransport};
use crate::scenarios::{ExerciserConfig, ScenarioError};
use crate::u2f::apdu::{decode_status_word, Request, ResponseLen};
use crate::u2f::attestation::{
    max_authenticate_response_len, verify_authentication, verify_registration,
    AuthenticateResponse, RegisterResponse,
};
use crate::u2f::constants::*;
use crate::utils::rand_bytes;
use crate::{check, check_eq, check_ne};

/// Credential material captured by [`enroll`] and reused by the sign
/// scenarios.
#[derive(Debug, Clone)]
pub struct Registration {
    pub application: [u8; U2F_APPID_SIZE],
    pub key_handle: Vec<u8>,
    pub user_public_key: [u8; U2F_EC_POINT_SIZE],
}

/// Options for the [`sign`] scenario family.
#[derive(Debug, Clone)]
pub struct SignOptions {
    pub control: u8,
    pub corrupt_key_handle: bool,
    pub corrupt_application: bool,
    pub response_len: ResponseLen,
    pub expected_status: u16,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            control: U2F_AUTH_ENFORCE,
            corrupt_key_handle: false,
            corrupt_application: false,
            response_len: ResponseLen::Any,
            expected_status: U2F_SW_NO_ERROR,
        }
    }
}

fn send_apdu<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    request: &Request,
    force_extended: bool,
) -> Result<(Vec<u8>, u16), ScenarioError> {
    let encoded = request.encode(force_extended)?;
    send_raw_apdu(config, transport, &encoded)
}

fn send_raw_apdu<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    encoded: &[u8],
) -> Result<(Vec<u8>, u16), ScenarioError> {
    let (cmd, reply) =
        transport.exchange_bounded(BLE_CMD_MSG, encoded, config.timeout, config.reply_limit)?;
    check_eq!(cmd, BLE_CMD_MSG);
    let (data, status) = decode_status_word(&reply)?;
    Ok((data.to_vec(), status))
}

/// The device must report the `U2F_V2` protocol version.
pub fn protocol_version<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let (data, status) = send_apdu(config, transport, &Request::version(), true)?;
    check_eq!(status, U2F_SW_NO_ERROR);
    check_eq!(data.len(), U2F_V2_VERSION_STR.len());
    check!(data == U2F_V2_VERSION_STR.as_bytes());
    log::info!("U2F version: {}", U2F_V2_VERSION_STR);
    Ok(())
}

/// An instruction outside the U2F set must be refused.
pub fn unknown_instruction<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let request = Request::new(0x00, 0x00, 0x00, 0x00, Vec::new(), ResponseLen::Any);
    let (data, status) = send_apdu(config, transport, &request, true)?;
    check_eq!(data.len(), 0);
    check_eq!(status, U2F_SW_INS_NOT_SUPPORTED);
    Ok(())
}

/// A non-zero class byte must not be accepted.
pub fn bad_cla<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let mut byte = [0u8; 1];
    rand_bytes(&mut byte)?;
    let cla = (byte[0] % 0xFF) + 1;

    let mut request = Request::version();
    request.cla = cla;
    let (data, status) = send_apdu(config, transport, &request, true)?;
    check_eq!(data.len(), 0);
    check_ne!(status, U2F_SW_NO_ERROR);
    Ok(())
}

/// A version request carrying stray body bytes must be refused as a length
/// error.
pub fn version_wrong_length<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let encoded = [0x00, U2F_VERSION, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03];
    let (data, status) = send_raw_apdu(config, transport, &encoded)?;
    check_eq!(data.len(), 0);
    check_eq!(status, U2F_SW_WRONG_LENGTH);
    Ok(())
}

/// A register request with a truncated parameter block must be refused as a
/// length error.
pub fn register_wrong_length<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let encoded = [0x00, U2F_REGISTER, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03];
    let (data, status) = send_raw_apdu(config, transport, &encoded)?;
    check_eq!(data.len(), 0);
    check_eq!(status, U2F_SW_WRONG_LENGTH);
    Ok(())
}

/// Register a fresh credential and verify the attestation signature chain
/// byte for byte.
pub fn enroll<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<Registration, ScenarioError> {
    let mut challenge = [0u8; U2F_CHAL_SIZE];
    rand_bytes(&mut challenge)?;
    let mut application = [0u8; U2F_APPID_SIZE];
    rand_bytes(&mut application)?;

    let start = Instant::now();
    let request = Request::register(&challenge, &application);
    let (data, status) = send_apdu(config, transport, &request, true)?;

    check_eq!(status, U2F_SW_NO_ERROR);
    check_ne!(data.len(), 0);
    log::info!("enroll: {} bytes in {:?}", data.len(), start.elapsed());

    let registration = RegisterResponse::read_from(&data)?;
    log::debug!("cert: {}", hex::encode(&registration.attestation_cert));
    log::debug!("sig : {}", hex::encode(&registration.signature));

    verify_registration(&application, &challenge, &registration)?;

    Ok(Registration {
        application,
        key_handle: registration.key_handle,
        user_public_key: registration.user_public_key,
    })
}

/// Authenticate with a registered credential. Returns the reported counter
/// on success, `None` when `options.expected_status` selects a refusal.
pub fn sign<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
    options: &SignOptions,
) -> Result<Option<u32>, ScenarioError> {
    let mut challenge = [0u8; U2F_CHAL_SIZE];
    rand_bytes(&mut challenge)?;

    let mut application = registration.application;
    if options.corrupt_application {
        application[0] ^= 0xAA;
    }
    let mut key_handle = registration.key_handle.clone();
    if options.corrupt_key_handle {
        key_handle[0] ^= 0x55;
    }

    let start = Instant::now();
    let mut request = Request::authenticate(options.control, &challenge, &application, &key_handle);
    request.response_len = options.response_len;
    let (data, status) = send_apdu(config, transport, &request, true)?;

    if options.expected_status != U2F_SW_NO_ERROR {
        check_eq!(status, options.expected_status);
        check_eq!(data.len(), 0);
        return Ok(None);
    }

    check_eq!(status, U2F_SW_NO_ERROR);
    check_ne!(data.len(), 0);
    check!(data.len() <= max_authenticate_response_len());
    log::info!("sign: {} bytes in {:?}", data.len(), start.elapsed());

    let assertion = AuthenticateResponse::read_from(&data)?;
    check_eq!(assertion.flags & U2F_AUTH_FLAG_TUP, U2F_AUTH_FLAG_TUP);
    verify_authentication(
        &registration.application,
        &challenge,
        &assertion,
        &registration.user_public_key,
    )?;

    Ok(Some(assertion.counter))
}

/// Two successive signatures must report strictly incrementing counters.
pub fn counter_increments<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions::default();
    let first = sign(config, transport, registration, &options)?
        .ok_or_else(|| ScenarioError::Check("first signature reported no counter".to_string()))?;
    let second = sign(config, transport, registration, &options)?
        .ok_or_else(|| ScenarioError::Check("second signature reported no counter".to_string()))?;

    check_eq!(second, first + 1);
    Ok(())
}

/// A check-only request over a valid handle must answer "user presence
/// required" without signing.
pub fn key_handle_check_only<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions {
        control: U2F_AUTH_CHECK_ONLY,
        expected_status: U2F_SW_CONDITIONS_NOT_SATISFIED,
        ..SignOptions::default()
    };
    sign(config, transport, registration, &options).map(|_| ())
}

/// A corrupted key handle must be refused as wrong data.
pub fn corrupted_key_handle<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions {
        corrupt_key_handle: true,
        expected_status: U2F_SW_WRONG_DATA,
        ..SignOptions::default()
    };
    sign(config, transport, registration, &options).map(|_| ())
}

/// A key handle presented under a different application must be refused as
/// wrong data.
pub fn corrupted_application<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions {
        corrupt_application: true,
        expected_status: U2F_SW_WRONG_DATA,
        ..SignOptions::default()
    };
    sign(config, transport, registration, &options).map(|_| ())
}

fn version_encoding<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    response_len: ResponseLen,
    force_extended: bool,
    expected_status: u16,
) -> Result<(), ScenarioError> {
    let mut request = Request::version();
    request.response_len = response_len;
    let (data, status) = send_apdu(config, transport, &request, force_extended)?;

    check_eq!(status, expected_status);
    if expected_status == U2F_SW_NO_ERROR {
        check!(data == U2F_V2_VERSION_STR.as_bytes());
    } else {
        check_eq!(data.len(), 0);
    }
    Ok(())
}

/// Short encoding, any response length.
pub fn encoding_short_any<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    version_encoding(config, transport, ResponseLen::Any, false, U2F_SW_NO_ERROR)
}

/// Short encoding, exact response length.
pub fn encoding_short_exact<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let exact = U2F_V2_VERSION_STR.len() as u16;
    version_encoding(config, transport, ResponseLen::Exact(exact), false, U2F_SW_NO_ERROR)
}

/// Short encoding, a response length too small for the version string.
pub fn encoding_short_wrong<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    version_encoding(config, transport, ResponseLen::Exact(2), false, U2F_SW_WRONG_LENGTH)
}

/// Extended encoding, any response length.
pub fn encoding_extended_any<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    version_encoding(config, transport, ResponseLen::Any, true, U2F_SW_NO_ERROR)
}

/// Extended encoding, exact response length.
pub fn encoding_extended_exact<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    let exact = U2F_V2_VERSION_STR.len() as u16;
    version_encoding(config, transport, ResponseLen::Exact(exact), true, U2F_SW_NO_ERROR)
}

/// Extended encoding, a response length too small for the version string.
pub fn encoding_extended_wrong<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    version_encoding(config, transport, ResponseLen::Exact(2), true, U2F_SW_WRONG_LENGTH)
}

/// Authenticate with the degenerate any-length response encoding.
pub fn encoding_sign_any<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    sign(config, transport, registration, &SignOptions::default()).map(|_| ())
}

/// Authenticate requesting exactly the largest possible response, derived
/// from the DER signature bound rather than a fixed constant.
pub fn encoding_sign_exact<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions {
        response_len: ResponseLen::Exact(max_authenticate_response_len() as u16),
        ..SignOptions::default()
    };
    sign(config, transport, registration, &options).map(|_| ())
}

/// Authenticate requesting fewer bytes than any signature needs.
pub fn encoding_sign_wrong<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    registration: &Registration,
) -> Result<(), ScenarioError> {
    let options = SignOptions {
        response_len: ResponseLen::Exact(8),
        expected_status: U2F_SW_WRONG_LENGTH,
        ..SignOptions::default()
    };
    sign(config, transport, registration, &options).map(|_| ())
}

#[cfg(test)]
use crate::virtual_device::VirtualAuthenticator;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
fn harness() -> (ExerciserConfig, Arc<BleTransport<VirtualAuthenticator>>) {
    let (device, receiver) = VirtualAuthenticator::new().unwrap();
    let transport = Arc::new(BleTransport::new(device));
    VirtualAuthenticator::pump(&transport, receiver);
    (ExerciserConfig::default(), transport)
}

#[test]
fn test_version_and_error_scenarios() {
    let (config, transport) = harness();
    protocol_version(&config, &transport).unwrap();
    unknown_instruction(&config, &transport).unwrap();
    bad_cla(&config, &transport).unwrap();
    version_wrong_length(&config, &transport).unwrap();
    register_wrong_length(&config, &transport).unwrap();
}

#[test]
fn test_enroll_and_sign_scenarios() {
    let (config, transport) = harness();
    let registration = enroll(&config, &transport).unwrap();

    counter_increments(&config, &transport, &registration).unwrap();
    key_handle_check_only(&config, &transport, &registration).unwrap();
    corrupted_key_handle(&config, &transport, &registration).unwrap();
    corrupted_application(&config, &transport, &registration).unwrap();
}

#[test]
fn test_encoding_scenarios() {
    let (config, transport) = harness();
    encoding_short_any(&config, &transport).unwrap();
    encoding_short_exact(&config, &transport).unwrap();
    encoding_short_wrong(&config, &transport).unwrap();
    encoding_extended_any(&config, &transport).unwrap();
    encoding_extended_exact(&config, &transport).unwrap();
    encoding_extended_wrong(&config, &transport).unwrap();

    let registration = enroll(&config, &transport).unwrap();
    encoding_sign_any(&config, &transport, &registration).unwrap();
    encoding_sign_exact(&config, &transport, &registration).unwrap();
    encoding_sign_wrong(&config, &transport, &registration).unwrap();
}
