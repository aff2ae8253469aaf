//! Advertisement-mode conformance checks. The platform captures one
//! advertisement + scan-response snapshot per state; sequencing the states
//! (user action, pairing attempts) stays with the embedder.

use crate::ble::advertisement::{
    find_service_uuid, is_pairing_mode, service_data_flags, AdSection,
};
use crate::ble::constants::*;
use crate::scenarios::ScenarioError;
use crate::{check, check_eq};

/// One captured advertising state of the device.
#[derive(Debug, Clone)]
pub struct AdvertisingSnapshot {
    pub advertisement: Vec<AdSection>,
    pub scan_response: Vec<AdSection>,
    /// The link is expected to pair with man-in-the-middle protection.
    pub authenticated_pairing: bool,
}

/// Classify a snapshot taken while the device is idle: the FIDO service is
/// advertised, discoverability is off, and any FIDO service-data section
/// agrees. Returns whether the service-data section was present.
pub fn not_pairing_mode(snapshot: &AdvertisingSnapshot) -> Result<bool, ScenarioError> {
    check!(find_service_uuid(
        &[&snapshot.advertisement, &snapshot.scan_response],
        FIDO_SERVICE_UUID16
    ));

    check_eq!(is_pairing_mode(&snapshot.advertisement)?, false);

    if let Some(flags) = service_data_flags(&snapshot.scan_response) {
        log::info!("service data field present");
        check_eq!(flags & SERVICE_DATA_PAIRING_MODE, 0);
        return Ok(true);
    }
    Ok(false)
}

/// Classify a snapshot taken while the device waits to pair: a
/// discoverability bit is set and any FIDO service-data section agrees,
/// including the passkey-entry bit when the link pairs authenticated.
/// Returns whether the service-data section was present.
pub fn pairing_mode(snapshot: &AdvertisingSnapshot) -> Result<bool, ScenarioError> {
    check_eq!(is_pairing_mode(&snapshot.advertisement)?, true);

    if let Some(flags) = service_data_flags(&snapshot.scan_response) {
        log::info!("service data field present");
        check_eq!(flags & SERVICE_DATA_PAIRING_MODE, SERVICE_DATA_PAIRING_MODE);
        if snapshot.authenticated_pairing {
            check_eq!(flags & SERVICE_DATA_PASSKEY_ENTRY, SERVICE_DATA_PASSKEY_ENTRY);
        }
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
fn snapshot(flags: u8, service_data: Option<u8>, authenticated: bool) -> AdvertisingSnapshot {
    let advertisement = vec![
        AdSection::new(AD_TYPE_FLAGS, &[flags]),
        AdSection::new(AD_TYPE_COMPLETE_16BIT_UUID, &[0xFD, 0xFF]),
    ];
    let mut scan_response = Vec::new();
    if let Some(flags) = service_data {
        scan_response.push(AdSection::new(AD_TYPE_SERVICE_DATA, &[0xFD, 0xFF, flags]));
    }
    AdvertisingSnapshot {
        advertisement,
        scan_response,
        authenticated_pairing: authenticated,
    }
}

#[test]
fn test_not_pairing_mode_classification() {
    assert!(!not_pairing_mode(&snapshot(0x00, None, false)).unwrap());
    assert!(not_pairing_mode(&snapshot(0x00, Some(0x00), false)).unwrap());

    // Discoverable while idle, or service data disagreeing, must fail.
    assert!(not_pairing_mode(&snapshot(0x02, None, false)).is_err());
    assert!(not_pairing_mode(&snapshot(0x00, Some(SERVICE_DATA_PAIRING_MODE), false)).is_err());

    // A missing Flags section is a validation failure, not "not pairing".
    let mut no_flags = snapshot(0x00, None, false);
    no_flags.advertisement.remove(0);
    assert!(not_pairing_mode(&no_flags).is_err());

    // The FIDO service UUID is mandatory in one of the two packets.
    let mut no_uuid = snapshot(0x00, None, false);
    no_uuid.advertisement.remove(1);
    assert!(not_pairing_mode(&no_uuid).is_err());
}

#[test]
fn test_pairing_mode_classification() {
    assert!(!pairing_mode(&snapshot(0x02, None, false)).unwrap());
    assert!(pairing_mode(&snapshot(0x01, Some(SERVICE_DATA_PAIRING_MODE), false)).unwrap());
    assert!(pairing_mode(&snapshot(
        0x02,
        Some(SERVICE_DATA_PAIRING_MODE | SERVICE_DATA_PASSKEY_ENTRY),
        true
    ))
    .unwrap());

    // Not discoverable, or service data disagreeing, must fail.
    assert!(pairing_mode(&snapshot(0x00, None, false)).is_err());
    assert!(pairing_mode(&snapshot(0x02, Some(0x00), false)).is_err());

    // Authenticated pairing requires the passkey-entry bit.
    assert!(pairing_mode(&snapshot(0x02, Some(SERVICE_DATA_PAIRING_MODE), true)).is_err());

    let mut no_flags = snapshot(0x02, None, false);
    no_flags.advertisement.remove(0);
    assert!(pairing_mode(&no_flags).is_err());
}
