//! VNC Authentication
//!
//! The classic RFB security type 2: the server sends a random 16-byte
//! challenge, the client DES-encrypts it with a key derived from the shared
//! password, and the server compares. The key is the password truncated or
//! NUL-padded to 8 bytes with the bits of each byte reversed, a quirk
//! inherited from the original VNC implementation.
//!
//! This is the single pre-shared-secret mechanism the server offers; there
//! is no user database and no transport encryption.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Challenge length in bytes
pub const CHALLENGE_LEN: usize = 16;

/// Generate a random challenge
pub fn make_challenge() -> [u8; CHALLENGE_LEN] {
    rand::random()
}

/// Compute the expected response for `challenge` under `password`
pub fn encrypt_challenge(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let mut key = [0u8; 8];
    for (dst, byte) in key.iter_mut().zip(password.bytes()) {
        *dst = byte.reverse_bits();
    }

    let cipher = Des::new(&key.into());

    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

/// Verify a client's response against the expected one
pub fn verify_response(
    password: &str,
    challenge: &[u8; CHALLENGE_LEN],
    response: &[u8; CHALLENGE_LEN],
) -> bool {
    let expected = encrypt_challenge(password, challenge);

    // Compare without early exit.
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(response.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_deterministic() {
        let challenge = [7u8; CHALLENGE_LEN];
        let a = encrypt_challenge("secret", &challenge);
        let b = encrypt_challenge("secret", &challenge);
        assert_eq!(a, b);
    }

    #[test]
    fn test_response_differs_from_challenge() {
        let challenge = [0u8; CHALLENGE_LEN];
        let response = encrypt_challenge("secret", &challenge);
        assert_ne!(response, challenge);
    }

    #[test]
    fn test_password_changes_response() {
        let challenge = [1u8; CHALLENGE_LEN];
        assert_ne!(
            encrypt_challenge("secret", &challenge),
            encrypt_challenge("Secret", &challenge)
        );
    }

    #[test]
    fn test_password_truncated_to_eight_bytes() {
        let challenge = [3u8; CHALLENGE_LEN];
        assert_eq!(
            encrypt_challenge("longpassword", &challenge),
            encrypt_challenge("longpass", &challenge)
        );
    }

    #[test]
    fn test_verify_roundtrip() {
        let challenge = make_challenge();
        let response = encrypt_challenge("hunter2", &challenge);
        assert!(verify_response("hunter2", &challenge, &response));
        assert!(!verify_response("hunter3", &challenge, &response));
    }

    #[test]
    fn test_challenges_are_random() {
        assert_ne!(make_challenge(), make_challenge());
    }
}
