//! Envelope ("pill") construction and parsing.
//!
//! A pill seals a plaintext under a password using:
//! - PBKDF2-HMAC-SHA1 to derive a 32-byte AES key from (password, salt)
//! - AES-256-CBC with PKCS#7 padding for encryption
//!
//! The binary format is:
//! - salt: 32 bytes, stored in the clear
//! - iv field: 32 bytes; the cipher consumes the leading 16-byte block
//! - ciphertext: variable length, a whole number of 16-byte blocks
//!
//! CBC carries no authentication tag. A wrong password or corrupted
//! ciphertext either trips the padding check (surfaced as
//! [`ErrorKind::TamperDetected`]) or silently yields garbage plaintext.
//! The second case is only detectable by the caller, by comparing the
//! recovered plaintext against an independently stored copy.

use crate::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use zeroize::Zeroizing;

/// Length of the salt field in bytes
pub const SALT_LEN: usize = 32;

/// Length of the IV field in bytes
pub const IV_LEN: usize = 32;

/// Length of the fixed salt+IV prefix; also the minimum envelope length
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;

/// Length of the derived key in bytes (AES-256)
const KEY_LEN: usize = 32;

/// AES block length; the slice of the IV field actually fed to CBC
const BLOCK_LEN: usize = 16;

/// Default PBKDF2 iteration count.
///
/// Far below modern hardening standards, but envelopes written by earlier
/// deployments of this system used exactly this count and cannot be
/// decrypted with any other. Use the `*_with_rounds` variants to harden
/// stores with no legacy data.
pub const DEFAULT_KDF_ROUNDS: u32 = 2;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Derive an AES-256 key from a password and salt using PBKDF2-HMAC-SHA1
fn derive_key(password: &[u8], salt: &[u8; SALT_LEN], rounds: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha1>(password, salt, rounds, &mut key[..]);
    key
}

/// Encrypt plaintext with a password, using a fresh random IV
///
/// Returns the binary format: salt(32) + iv(32) + ciphertext(variable).
/// Two calls with identical inputs produce different envelopes.
pub fn encrypt(password: &[u8], salt: &[u8; SALT_LEN], plaintext: &[u8]) -> Vec<u8> {
    encrypt_with_rounds(password, salt, plaintext, DEFAULT_KDF_ROUNDS)
}

/// Encrypt with an explicit PBKDF2 iteration count
pub fn encrypt_with_rounds(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    plaintext: &[u8],
    rounds: u32,
) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    encrypt_deterministic(password, salt, &iv, plaintext, rounds)
}

/// Encrypt plaintext with a provided IV
///
/// This function is ONLY for testing purposes to generate deterministic
/// output. NEVER use this in production - always use `encrypt()`, which
/// generates a random IV per call.
pub fn encrypt_deterministic(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
    rounds: u32,
) -> Vec<u8> {
    let key = derive_key(password, salt, rounds);

    // The wire format reserves 32 bytes for the IV field; CBC consumes
    // the leading block.
    let mut block_iv = [0u8; BLOCK_LEN];
    block_iv.copy_from_slice(&iv[..BLOCK_LEN]);

    let cipher = Aes256CbcEnc::new((&*key).into(), (&block_iv).into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    envelope.extend_from_slice(salt);
    envelope.extend_from_slice(iv);
    envelope.extend_from_slice(&ciphertext);

    envelope
}

/// Decrypt an envelope with a password
pub fn decrypt(password: &[u8], envelope: &[u8]) -> Result<Vec<u8>> {
    decrypt_with_rounds(password, envelope, DEFAULT_KDF_ROUNDS)
}

/// Decrypt with an explicit PBKDF2 iteration count
///
/// Fails with [`ErrorKind::MalformedEnvelope`] if the input is shorter
/// than the salt+IV header, and with [`ErrorKind::TamperDetected`] if the
/// padding check fails after decryption. A padding-valid envelope sealed
/// under a different password decrypts without error into garbage; see
/// the module documentation for the caller's side of that contract.
pub fn decrypt_with_rounds(password: &[u8], envelope: &[u8], rounds: u32) -> Result<Vec<u8>> {
    if envelope.len() < HEADER_LEN {
        return Err(PillboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::MalformedEnvelope,
            format!(
                "envelope is {} bytes, shorter than the {} byte salt+iv header",
                envelope.len(),
                HEADER_LEN
            ),
        ));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&envelope[..SALT_LEN]);

    let mut block_iv = [0u8; BLOCK_LEN];
    block_iv.copy_from_slice(&envelope[SALT_LEN..SALT_LEN + BLOCK_LEN]);

    let ciphertext = &envelope[HEADER_LEN..];

    let key = derive_key(password, &salt, rounds);
    let cipher = Aes256CbcDec::new((&*key).into(), (&block_iv).into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| {
            PillboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::TamperDetected,
                "padding check failed after decryption: wrong password, corruption, or tampering",
            )
        })?;

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUNDS: u32 = DEFAULT_KDF_ROUNDS;

    #[test]
    fn test_roundtrip_small_plaintext() {
        let salt = [7u8; SALT_LEN];
        let envelope = encrypt(b"password", &salt, b"hello");
        let decrypted = decrypt(b"password", &envelope).unwrap();

        assert_eq!(b"hello", &decrypted[..]);
    }

    #[test]
    fn test_roundtrip_empty_plaintext() {
        let salt = [0u8; SALT_LEN];
        let envelope = encrypt(b"password", &salt, b"");
        let decrypted = decrypt(b"password", &envelope).unwrap();

        assert_eq!(b"", &decrypted[..]);
    }

    #[test]
    fn test_roundtrip_all_byte_values() {
        let salt = [3u8; SALT_LEN];
        let plaintext: Vec<u8> = (0..=255).collect();

        let envelope = encrypt(b"password", &salt, &plaintext);
        let decrypted = decrypt(b"password", &envelope).unwrap();

        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_roundtrip_any_salt() {
        for fill in [0u8, 1, 0x42, 0xFF] {
            let salt = [fill; SALT_LEN];
            let envelope = encrypt(b"password", &salt, b"some data");
            assert_eq!(b"some data", &decrypt(b"password", &envelope).unwrap()[..]);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let salt = [1u8; SALT_LEN];

        let e1 = encrypt(b"password", &salt, b"identical input");
        let e2 = encrypt(b"password", &salt, b"identical input");

        // Same password, salt, and plaintext still produce different
        // envelopes because the IV is drawn fresh each call.
        assert_ne!(e1, e2);
        assert_ne!(e1[SALT_LEN..HEADER_LEN], e2[SALT_LEN..HEADER_LEN]);
    }

    #[test]
    fn test_deterministic_encryption() {
        let salt = [1u8; SALT_LEN];
        let iv = [2u8; IV_LEN];

        let e1 = encrypt_deterministic(b"password", &salt, &iv, b"hello world", ROUNDS);
        let e2 = encrypt_deterministic(b"password", &salt, &iv, b"hello world", ROUNDS);

        assert_eq!(e1, e2);
        assert_eq!(b"hello world", &decrypt(b"password", &e1).unwrap()[..]);
    }

    #[test]
    fn test_envelope_layout() {
        let salt = [9u8; SALT_LEN];
        let iv = [4u8; IV_LEN];
        let envelope = encrypt_deterministic(b"password", &salt, &iv, b"layout", ROUNDS);

        assert_eq!(&envelope[..SALT_LEN], &salt);
        assert_eq!(&envelope[SALT_LEN..HEADER_LEN], &iv);
    }

    #[test]
    fn test_envelope_size_invariant() {
        let salt = [5u8; SALT_LEN];

        // PKCS#7 always pads, so ciphertext is the next whole block up.
        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let plaintext = vec![0x61u8; len];
            let envelope = encrypt(b"password", &salt, &plaintext);
            let expected_ct = ((len / 16) + 1) * 16;
            assert_eq!(envelope.len(), HEADER_LEN + expected_ct, "plaintext len {}", len);
        }
    }

    #[test]
    fn test_short_input_is_malformed() {
        for len in [0usize, 1, 32, 63] {
            let err = decrypt(b"password", &vec![0u8; len]).expect_err("expected parse failure");
            assert_eq!(err.kind, Some(ErrorKind::MalformedEnvelope), "len {}", len);
        }
    }

    #[test]
    fn test_header_only_envelope_is_tamper() {
        // 64 bytes parses fine but holds zero ciphertext blocks; the
        // padding check has nothing valid to strip.
        let err = decrypt(b"password", &[0u8; HEADER_LEN]).expect_err("expected failure");
        assert_eq!(err.kind, Some(ErrorKind::TamperDetected));
    }

    #[test]
    fn test_partial_block_is_tamper() {
        let salt = [5u8; SALT_LEN];
        let mut envelope = encrypt(b"password", &salt, b"block aligned data");
        // Chop the ciphertext off mid-block.
        envelope.truncate(HEADER_LEN + 5);

        let err = decrypt(b"password", &envelope).expect_err("expected failure");
        assert_eq!(err.kind, Some(ErrorKind::TamperDetected));
    }

    #[test]
    fn test_wrong_password_never_silently_succeeds() {
        let salt = [8u8; SALT_LEN];
        let plaintext = b"secret data";
        let envelope = encrypt(b"correct", &salt, plaintext);

        match decrypt(b"wrong", &envelope) {
            Err(err) => assert_eq!(err.kind, Some(ErrorKind::TamperDetected)),
            // CBC without authentication may decrypt under the wrong key
            // if the padding happens to validate; the output must at least
            // differ from the original.
            Ok(recovered) => assert_ne!(recovered, plaintext),
        }
    }

    #[test]
    fn test_ciphertext_bitflip_never_returns_original() {
        let salt = [6u8; SALT_LEN];
        let plaintext = b"the original plaintext, long enough for several blocks";
        let envelope = encrypt(b"password", &salt, plaintext);

        for i in HEADER_LEN..envelope.len() {
            let mut tampered = envelope.clone();
            tampered[i] ^= 0x01;

            match decrypt(b"password", &tampered) {
                Err(err) => assert_eq!(err.kind, Some(ErrorKind::TamperDetected), "byte {}", i),
                Ok(recovered) => assert_ne!(recovered, plaintext, "byte {}", i),
            }
        }
    }

    #[test]
    fn test_rounds_must_match() {
        let salt = [2u8; SALT_LEN];
        let envelope = encrypt_with_rounds(b"password", &salt, b"hardened", 1000);

        assert_eq!(
            b"hardened",
            &decrypt_with_rounds(b"password", &envelope, 1000).unwrap()[..]
        );

        // Decrypting under the default count derives a different key.
        match decrypt(b"password", &envelope) {
            Err(err) => assert_eq!(err.kind, Some(ErrorKind::TamperDetected)),
            Ok(recovered) => assert_ne!(&recovered[..], b"hardened"),
        }
    }
}
