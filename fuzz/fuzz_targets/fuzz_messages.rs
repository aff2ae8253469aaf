#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate blauth;

use blauth::u2f::apdu::{decode_status_word, Request, Response};
use blauth::u2f::attestation::{
    certificate, signature, subject_public_key, AuthenticateResponse, RegisterResponse,
};

fuzz_target!(|data: &[u8]| {
    let _ = Request::decode(data);
    let _ = Response::read_from(data);
    let _ = decode_status_word(data);

    let _ = RegisterResponse::read_from(data);
    let _ = AuthenticateResponse::read_from(data);

    let _ = certificate(data);
    let _ = signature(data);
    let _ = subject_public_key(data);
});
