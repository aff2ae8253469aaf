use byteorder::{ByteOrder, LittleEndian};

use crate::ble::constants::*;
use crate::ble::error::AdvertisementError;

/// One AD structure from an advertisement or scan-response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdSection {
    pub section_type: u8,
    pub data: Vec<u8>,
}

impl AdSection {
    pub fn new(section_type: u8, data: &[u8]) -> Self {
        AdSection {
            section_type,
            data: data.to_vec(),
        }
    }
}

/// Parse a raw advertising payload (`length, type, data` triplets) into a
/// section list. A zero length byte terminates the payload (padding).
pub fn parse_sections(raw: &[u8]) -> Result<Vec<AdSection>, AdvertisementError> {
    let mut sections = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let len = raw[offset] as usize;
        if len == 0 {
            break;
        }
        if offset + 1 + len > raw.len() {
            return Err(AdvertisementError::Truncated);
        }
        sections.push(AdSection {
            section_type: raw[offset + 1],
            data: raw[offset + 2..offset + 1 + len].to_vec(),
        });
        offset += 1 + len;
    }

    Ok(sections)
}

pub fn find_section<'a>(sections: &'a [AdSection], section_type: u8) -> Option<&'a AdSection> {
    sections.iter().find(|s| s.section_type == section_type)
}

/// Scan every 16-bit service UUID section (complete and incomplete lists)
/// across the given section lists for `uuid16`. Entries are little-endian.
pub fn find_service_uuid(lists: &[&[AdSection]], uuid16: u16) -> bool {
    for sections in lists {
        for section in sections.iter() {
            if section.section_type != AD_TYPE_MORE_16BIT_UUID
                && section.section_type != AD_TYPE_COMPLETE_16BIT_UUID
            {
                continue;
            }
            for entry in section.data.chunks_exact(2) {
                if LittleEndian::read_u16(entry) == uuid16 {
                    return true;
                }
            }
        }
    }
    false
}

/// Whether the Flags section declares either LE discoverability bit.
///
/// The Flags section is mandatory in a connectable advertisement, so its
/// absence is a validation failure rather than "not pairing mode".
pub fn is_pairing_mode(sections: &[AdSection]) -> Result<bool, AdvertisementError> {
    let flags = find_section(sections, AD_TYPE_FLAGS).ok_or(AdvertisementError::MissingFlags)?;
    if flags.data.is_empty() {
        return Err(AdvertisementError::MissingFlags);
    }

    Ok(flags.data[0] & (FLAG_LE_LIMITED_DISCOVERABLE | FLAG_LE_GENERAL_DISCOVERABLE) != 0)
}

/// The flags byte of the FIDO service-data section, when one is present and
/// carries the FIDO service UUID.
pub fn service_data_flags(sections: &[AdSection]) -> Option<u8> {
    let section = find_section(sections, AD_TYPE_SERVICE_DATA)?;
    if section.data.len() < 3 {
        return None;
    }
    if LittleEndian::read_u16(&section.data[..2]) != FIDO_SERVICE_UUID16 {
        return None;
    }
    Some(section.data[2])
}

pub fn service_data_pairing_mode(sections: &[AdSection]) -> Option<bool> {
    service_data_flags(sections).map(|f| f & SERVICE_DATA_PAIRING_MODE != 0)
}

pub fn service_data_passkey_entry(sections: &[AdSection]) -> Option<bool> {
    service_data_flags(sections).map(|f| f & SERVICE_DATA_PASSKEY_ENTRY != 0)
}

#[test]
fn test_parse_sections() {
    let raw = [
        0x02, AD_TYPE_FLAGS, 0x06, // flags
        0x03, AD_TYPE_COMPLETE_16BIT_UUID, 0xFD, 0xFF, // FIDO uuid
        0x00, 0xAA, // zero length terminates, trailing padding ignored
    ];
    let sections = parse_sections(&raw).unwrap();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0], AdSection::new(AD_TYPE_FLAGS, &[0x06]));
    assert_eq!(sections[1], AdSection::new(AD_TYPE_COMPLETE_16BIT_UUID, &[0xFD, 0xFF]));
}

#[test]
fn test_parse_sections_truncated() {
    assert_eq!(parse_sections(&[0x05, AD_TYPE_FLAGS, 0x06]), Err(AdvertisementError::Truncated));
}

#[test]
fn test_find_service_uuid_across_lists() {
    let adv = vec![AdSection::new(AD_TYPE_FLAGS, &[0x02])];
    let scanresp = vec![AdSection::new(
        AD_TYPE_MORE_16BIT_UUID,
        &[0x0F, 0x18, 0xFD, 0xFF],
    )];
    assert!(find_service_uuid(&[&adv, &scanresp], FIDO_SERVICE_UUID16));
    assert!(!find_service_uuid(&[&adv], FIDO_SERVICE_UUID16));
    assert!(find_service_uuid(&[&scanresp], 0x180F));
}

#[test]
fn test_pairing_mode_flags() {
    let pairing = vec![AdSection::new(AD_TYPE_FLAGS, &[0x02])];
    let limited = vec![AdSection::new(AD_TYPE_FLAGS, &[0x01])];
    let idle = vec![AdSection::new(AD_TYPE_FLAGS, &[0x00])];
    let missing: Vec<AdSection> = vec![];

    assert_eq!(is_pairing_mode(&pairing), Ok(true));
    assert_eq!(is_pairing_mode(&limited), Ok(true));
    assert_eq!(is_pairing_mode(&idle), Ok(false));
    assert_eq!(is_pairing_mode(&missing), Err(AdvertisementError::MissingFlags));
}

#[test]
fn test_service_data_flags() {
    let fido = vec![AdSection::new(AD_TYPE_SERVICE_DATA, &[0xFD, 0xFF, 0x80])];
    let other = vec![AdSection::new(AD_TYPE_SERVICE_DATA, &[0x0F, 0x18, 0x80])];

    assert_eq!(service_data_flags(&fido), Some(0x80));
    assert_eq!(service_data_pairing_mode(&fido), Some(true));
    assert_eq!(service_data_passkey_entry(&fido), Some(false));
    assert_eq!(service_data_flags(&other), None);
}
