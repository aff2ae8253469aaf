#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate blauth;

use blauth::ble::advertisement::{
    find_service_uuid, is_pairing_mode, parse_sections, service_data_flags,
};
use blauth::ble::constants::FIDO_SERVICE_UUID16;

fuzz_target!(|data: &[u8]| {
    if let Ok(sections) = parse_sections(data) {
        let _ = find_service_uuid(&[&sections], FIDO_SERVICE_UUID16);
        let _ = is_pairing_mode(&sections);
        let _ = service_data_flags(&sections);
    }
});
