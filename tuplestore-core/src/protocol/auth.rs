//! Challenge-response password scrambling.

use sha1::{Digest, Sha1};

use super::constants::SCRAMBLE_SIZE;
use crate::error::{Result, TupleStoreError};

/// Computes the authentication scramble for a password and greeting salt.
///
/// The scheme is `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`,
/// which proves knowledge of the password without sending it.
pub fn scramble(salt: &[u8], password: &str) -> Result<Vec<u8>> {
    if salt.len() < SCRAMBLE_SIZE {
        return Err(TupleStoreError::AuthFailed(format!(
            "salt too short for scramble: {} bytes",
            salt.len()
        )));
    }

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut mixer = Sha1::new();
    mixer.update(&salt[..SCRAMBLE_SIZE]);
    mixer.update(hash2);
    let mixed = mixer.finalize();

    Ok(hash1
        .iter()
        .zip(mixed.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}
