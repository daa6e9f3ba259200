//! Shared-secret challenge/response for the network control channel.
//!
//! The client sends its component name, the server answers with a
//! random challenge, and the client proves knowledge of the secret by
//! sending `md5_hex(challenge + ":" + secret)`. This is not mutual
//! authentication, and nothing is encrypted.

use rand::{seq::SliceRandom, Rng};

use crate::digest::md5_hex;

/// Printable characters a challenge is made of (no newline, no EOT).
const CHALLENGE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
ABCDEFGHIJKLMNOPQRSTUVWXYZ\
1234567890\
!@#$%^&*()\
`~-_=+[{]}\\|;:'\",<.>/? ";

pub const CHALLENGE_LEN: usize = 32;

pub fn challenge_with<R: Rng>(rng: &mut R) -> String {
    (0..CHALLENGE_LEN)
        .map(|_| *CHALLENGE_ALPHABET.choose(rng).unwrap_or(&b'x') as char)
        .collect()
}

pub fn challenge() -> String {
    challenge_with(&mut rand::thread_rng())
}

pub fn response(challenge: &str, secret: &str) -> String {
    md5_hex(format!("{challenge}:{secret}").as_bytes())
}

/// Constant time comparison of the expected and received responses.
pub fn verify(challenge: &str, secret: &str, received: &str) -> bool {
    let expected = response(challenge, secret);
    let (a, b) = (expected.as_bytes(), received.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
