//! Challenge-response computations for the supported security types.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use des::Des;
use md5::{Digest, Md5};
use num_bigint::BigUint;
use rand::RngCore;

use crate::{Error, Result};

/// Derives the DES key from a VNC password: truncate or NUL-pad to eight
/// bytes, then mirror the bit order of each byte. RFC 6143 §7.2.2 leaves
/// the mirroring unspecified, but every deployed server does it.
pub fn vnc_auth_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    key
}

/// Encrypts the 16-byte VNC-Auth challenge as two independent DES-ECB
/// blocks under the password-derived key.
pub fn vnc_auth_response(password: &str, challenge: &[u8; 16]) -> Result<[u8; 16]> {
    let key = vnc_auth_key(password);
    let cipher =
        Des::new_from_slice(&key).map_err(|_| Error::Unexpected("DES key length"))?;
    let mut response = [0u8; 16];
    response.copy_from_slice(challenge);
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(block.into());
    }
    Ok(response)
}

fn pad_be(value: &BigUint, length: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut padded = vec![0u8; length.saturating_sub(bytes.len())];
    padded.extend_from_slice(&bytes);
    padded
}

/// Apple Remote Desktop Diffie-Hellman response: derives a shared AES key
/// from the server's group parameters and encrypts the credential block.
/// Returns the 128-byte ciphertext and our public key, both ready for the
/// wire.
pub fn ard_auth_response(
    username: &str,
    password: &str,
    generator: u16,
    modulus: &[u8],
    server_key: &[u8],
) -> Result<([u8; 128], Vec<u8>)> {
    let mut secret_bytes = vec![0u8; 512];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    let secret = BigUint::from_bytes_be(&secret_bytes);
    let generator = BigUint::from(generator);
    let modulus_int = BigUint::from_bytes_be(modulus);
    let server_public = BigUint::from_bytes_be(server_key);

    let public = generator.modpow(&secret, &modulus_int);
    let shared = server_public.modpow(&secret, &modulus_int);

    let mut hash = Md5::new();
    hash.update(pad_be(&shared, modulus.len()));
    let key_digest = hash.finalize();

    let mut user_struct = [0u8; 128];
    for (slot, byte) in user_struct[..64].iter_mut().zip(username.bytes()) {
        *slot = byte;
    }
    for (slot, byte) in user_struct[64..].iter_mut().zip(password.bytes()) {
        *slot = byte;
    }

    let cipher = Aes128::new_from_slice(&key_digest)
        .map_err(|_| Error::Unexpected("AES key length"))?;
    for block in user_struct.chunks_exact_mut(16) {
        cipher.encrypt_block(block.into());
    }

    Ok((user_struct, pad_be(&public, modulus.len())))
}
