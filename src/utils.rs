use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};

/// Fill `dest` with cryptographically secure random bytes.
pub fn rand_bytes(dest: &mut [u8]) -> Result<(), Unspecified> {
    SystemRandom::new().fill(dest)
}

#[inline]
pub(crate) fn be_u16(buffer: &[u8], offset: usize) -> u16 {
    ((buffer[offset] as u16) << 8) | (buffer[offset + 1] as u16)
}
