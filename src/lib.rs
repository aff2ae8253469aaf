//! # Blauth
//!
//! Conformance exerciser for FIDO U2F authenticators reached over a BLE
//! GATT transport: frame segmentation/reassembly, U2F APDU encoding,
//! attestation verification and the certification scenario bodies.

/// Shared helpers
pub mod utils;
/// BLE framing, transport and advertisement inspection
pub mod ble;
/// U2F APDU codec, attestation verification and software token
pub mod u2f;
/// Simulated authenticator reachable through the transport
pub mod virtual_device;
/// Conformance scenario bodies and reporting
pub mod scenarios;
