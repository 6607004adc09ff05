//! AES-CTR frame decryption.
//!
//! Each stream carries its own key and IV mask from the OFFER. The IV for
//! frame N is the mask with the big-endian encoding of N XOR'd into bytes
//! 8..12; `reset` must be called between frames. Frame 0 uses the mask
//! unchanged.

use aes::cipher::{KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const IV_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DecrypterError {
    #[error("invalid AES key length {0} (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),
    #[error("invalid IV mask length {0} (expected {IV_SIZE})")]
    InvalidIvLength(usize),
}

enum Keystream {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl std::fmt::Debug for Keystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keystream::Aes128(_) => write!(f, "Keystream::Aes128"),
            Keystream::Aes192(_) => write!(f, "Keystream::Aes192"),
            Keystream::Aes256(_) => write!(f, "Keystream::Aes256"),
        }
    }
}

#[derive(Debug)]
pub struct Decrypter {
    key: Vec<u8>,
    iv_mask: [u8; IV_SIZE],
    stream: Keystream,
}

impl Decrypter {
    pub fn new(key: &[u8], iv_mask: &[u8]) -> Result<Self, DecrypterError> {
        let iv_mask: [u8; IV_SIZE] = iv_mask
            .try_into()
            .map_err(|_| DecrypterError::InvalidIvLength(iv_mask.len()))?;
        let stream = Self::keystream(key, &iv_mask)?;
        Ok(Self {
            key: key.to_vec(),
            iv_mask,
            stream,
        })
    }

    fn keystream(key: &[u8], iv: &[u8; IV_SIZE]) -> Result<Keystream, DecrypterError> {
        if let Ok(key) = <[u8; 16]>::try_from(key) {
            Ok(Keystream::Aes128(Box::new(Aes128Ctr::new(
                &key.into(),
                &(*iv).into(),
            ))))
        } else if let Ok(key) = <[u8; 24]>::try_from(key) {
            Ok(Keystream::Aes192(Box::new(Aes192Ctr::new(
                &key.into(),
                &(*iv).into(),
            ))))
        } else if let Ok(key) = <[u8; 32]>::try_from(key) {
            Ok(Keystream::Aes256(Box::new(Aes256Ctr::new(
                &key.into(),
                &(*iv).into(),
            ))))
        } else {
            Err(DecrypterError::InvalidKeyLength(key.len()))
        }
    }

    /// Re-key the keystream for the given frame.
    pub fn reset(&mut self, frame_id: u32) {
        let mut iv = self.iv_mask;
        for (offset, byte) in frame_id.to_be_bytes().iter().enumerate() {
            iv[8 + offset] ^= byte;
        }
        // Lengths were validated in `new`; re-keying cannot fail.
        if let Ok(stream) = Self::keystream(&self.key, &iv) {
            self.stream = stream;
        }
    }

    /// XOR the keystream over `data` in place. Buffers within one frame
    /// must be decrypted in order.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        match &mut self.stream {
            Keystream::Aes128(stream) => stream.apply_keystream(data),
            Keystream::Aes192(stream) => stream.apply_keystream(data),
            Keystream::Aes256(stream) => stream.apply_keystream(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"example key 1234";
    const IV_MASK: [u8; 16] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x10, 0x32, 0x54, 0x76, 0x98, 0xba,
        0xdc, 0xfe,
    ];

    fn ctr_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let mut data = plaintext.to_vec();
        let mut cipher = Aes128Ctr::new(&(*key).into(), &(*iv).into());
        cipher.apply_keystream(&mut data);
        data
    }

    #[test]
    fn accepts_all_aes_key_lengths() {
        for len in [16usize, 24, 32] {
            let key = vec![0x42u8; len];
            assert!(Decrypter::new(&key, &IV_MASK).is_ok(), "key length {len}");
        }
    }

    #[test]
    fn rejects_invalid_key_length() {
        match Decrypter::new(&[0x00, 0x01, 0x02], &IV_MASK) {
            Err(DecrypterError::InvalidKeyLength(3)) => {}
            other => panic!("expected InvalidKeyLength(3), got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_iv_length() {
        match Decrypter::new(KEY, &[0u8; 12]) {
            Err(DecrypterError::InvalidIvLength(12)) => {}
            other => panic!("expected InvalidIvLength(12), got {other:?}"),
        }
    }

    #[test]
    fn decrypts_frame_zero_without_reset() {
        let plaintext = b"hello world!!!!";
        let ciphertext = ctr_encrypt(KEY, &IV_MASK, plaintext);

        let mut decrypter = Decrypter::new(KEY, &IV_MASK).unwrap();
        let mut output = ciphertext;
        decrypter.decrypt(&mut output);
        assert_eq!(output, plaintext);
    }

    #[test]
    fn decrypts_after_reset() {
        let frame_id = 42u32;
        let mut iv = IV_MASK;
        for (offset, byte) in frame_id.to_be_bytes().iter().enumerate() {
            iv[8 + offset] ^= byte;
        }

        let plaintext = b"frame-specific data";
        let ciphertext = ctr_encrypt(KEY, &iv, plaintext);

        let mut decrypter = Decrypter::new(KEY, &IV_MASK).unwrap();
        decrypter.reset(frame_id);
        let mut output = ciphertext;
        decrypter.decrypt(&mut output);
        assert_eq!(output, plaintext);
    }

    #[test]
    fn reset_to_frame_zero_matches_fresh_decrypter() {
        let plaintext = b"same keystream either way";
        let ciphertext = ctr_encrypt(KEY, &IV_MASK, plaintext);

        let mut decrypter = Decrypter::new(KEY, &IV_MASK).unwrap();
        decrypter.reset(7);
        decrypter.reset(0);
        let mut output = ciphertext;
        decrypter.decrypt(&mut output);
        assert_eq!(output, plaintext);
    }

    #[test]
    fn split_buffers_continue_the_keystream() {
        let plaintext = b"split across two datagrams";
        let ciphertext = ctr_encrypt(KEY, &IV_MASK, plaintext);

        let mut decrypter = Decrypter::new(KEY, &IV_MASK).unwrap();
        let (first, second) = ciphertext.split_at(9);
        let mut a = first.to_vec();
        let mut b = second.to_vec();
        decrypter.decrypt(&mut a);
        decrypter.decrypt(&mut b);
        a.extend_from_slice(&b);
        assert_eq!(a, plaintext);
    }
}
