use core::cmp;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, Key, KeyIvInit, Unsigned};
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::RnsError;

type AesCbcEnc = cbc::Encryptor<aes::Aes256>;
type AesCbcDec = cbc::Decryptor<aes::Aes256>;
type AesKey = Key<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const HMAC_SIZE: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
const AES_KEY_SIZE: usize = <<aes::Aes256 as KeySizeUser>::KeySize as Unsigned>::USIZE;
const IV_SIZE: usize = <<AesCbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
const AES_BLOCK_SIZE: usize = <<aes::Aes256 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

pub const TOKEN_OVERHEAD_SIZE: usize = IV_SIZE + HMAC_SIZE;
pub const TOKEN_MAX_PADDING_SIZE: usize = AES_BLOCK_SIZE;

/// Authenticated-encryption token: AES-256-CBC over PKCS7-padded plaintext,
/// authenticated with HMAC-SHA256.
///
/// This is the Fernet construction with the version and timestamp fields
/// removed. Those fields carry no information Reticulum needs and leak
/// initiator metadata, so the wire format is `IV ∥ ciphertext ∥ HMAC`.
pub struct TokenCipher {
    sign_key: [u8; AES_KEY_SIZE],
    enc_key: AesKey,
}

impl TokenCipher {
    pub fn new_from_slices(sign_key: &[u8], enc_key: &[u8]) -> Self {
        let mut sign_key_bytes = [0u8; AES_KEY_SIZE];
        let sign_len = cmp::min(AES_KEY_SIZE, sign_key.len());
        sign_key_bytes[..sign_len].copy_from_slice(&sign_key[..sign_len]);

        let mut enc_key_bytes = [0u8; AES_KEY_SIZE];
        let enc_len = cmp::min(AES_KEY_SIZE, enc_key.len());
        enc_key_bytes[..enc_len].copy_from_slice(&enc_key[..enc_len]);

        Self { sign_key: sign_key_bytes, enc_key: enc_key_bytes.into() }
    }

    pub fn new_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut sign_key = [0u8; AES_KEY_SIZE];
        rng.fill_bytes(&mut sign_key);
        let enc_key = AesCbcEnc::generate_key(&mut rng);
        Self { sign_key, enc_key }
    }

    pub const fn token_len(plaintext_len: usize) -> usize {
        TOKEN_OVERHEAD_SIZE + (plaintext_len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
    }

    pub fn encrypt<'a, R: CryptoRngCore>(
        &self,
        plaintext: &[u8],
        out_buf: &'a mut [u8],
        rng: R,
    ) -> Result<&'a [u8], RnsError> {
        let required = Self::token_len(plaintext.len());
        if out_buf.len() < required {
            return Err(RnsError::InvalidArgument);
        }

        let iv = AesCbcEnc::generate_iv(rng);
        out_buf[..IV_SIZE].copy_from_slice(iv.as_slice());
        let mut out_len = IV_SIZE;

        let cipher_len = AesCbcEnc::new(&self.enc_key, &iv)
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut out_buf[out_len..])
            .map_err(|_| RnsError::InvalidArgument)?
            .len();
        out_len += cipher_len;

        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidArgument)?;
        hmac.update(&out_buf[..out_len]);
        let tag = hmac.finalize().into_bytes();

        out_buf[out_len..out_len + HMAC_SIZE].copy_from_slice(tag.as_slice());
        out_len += HMAC_SIZE;

        Ok(&out_buf[..out_len])
    }

    pub fn verify(&self, token: &[u8]) -> Result<(), RnsError> {
        if token.len() <= TOKEN_OVERHEAD_SIZE {
            return Err(RnsError::InvalidArgument);
        }

        let expected_tag = &token[token.len() - HMAC_SIZE..];
        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidArgument)?;
        hmac.update(&token[..token.len() - HMAC_SIZE]);
        let actual_tag = hmac.finalize().into_bytes();

        // Ordering-based comparison keeps the scan constant time.
        let equal = expected_tag
            .iter()
            .zip(actual_tag.as_slice())
            .map(|(lhs, rhs)| lhs.cmp(rhs))
            .find(|&order| order != cmp::Ordering::Equal)
            .unwrap_or(actual_tag.len().cmp(&expected_tag.len()))
            == cmp::Ordering::Equal;

        if equal {
            Ok(())
        } else {
            Err(RnsError::IncorrectSignature)
        }
    }

    pub fn decrypt<'a>(&self, token: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        self.verify(token)?;

        let tag_start = token.len() - HMAC_SIZE;
        let iv: [u8; IV_SIZE] =
            token[..IV_SIZE].try_into().map_err(|_| RnsError::InvalidArgument)?;
        let ciphertext = &token[IV_SIZE..tag_start];

        let plaintext = AesCbcDec::new(&self.enc_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out_buf)
            .map_err(|_| RnsError::CryptoError)?;

        Ok(plaintext)
    }
}
