//! Software implementation of the device crypto capabilities

use super::PlatformError;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use std::path::Path;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;

/// RSA + AES-CBC decryption backed by a PEM private key
pub struct SoftwareCrypto {
    private_key: Option<RsaPrivateKey>,
}

impl SoftwareCrypto {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key: Some(private_key),
        }
    }

    /// Crypto without a private key; every RSA operation fails
    pub fn without_key() -> Self {
        Self { private_key: None }
    }

    /// Parse a PKCS#8 or PKCS#1 PEM document
    pub fn from_pem(pem: &str) -> Result<Self, PlatformError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| PlatformError::KeyUnavailable(format!("invalid PEM key: {e}")))?;
        Ok(Self::new(key))
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, PlatformError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            PlatformError::KeyUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    pub fn has_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| PlatformError::KeyUnavailable("no device key loaded".to_string()))?;
        key.decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| PlatformError::Crypto(format!("RSA decrypt failed: {e}")))
    }

    pub fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, PlatformError> {
        aes_cbc_decrypt(key, iv, ciphertext)
    }
}

/// AES-CBC decrypt, key size selects AES-128/192/256
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, PlatformError> {
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(PlatformError::Crypto(format!(
            "ciphertext length {} is not a multiple of the AES block size",
            ciphertext.len()
        )));
    }

    let result = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| PlatformError::Crypto(format!("invalid key/iv: {e:?}")))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        24 => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(|e| PlatformError::Crypto(format!("invalid key/iv: {e:?}")))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| PlatformError::Crypto(format!("invalid key/iv: {e:?}")))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        other => {
            return Err(PlatformError::Crypto(format!(
                "unsupported AES key length {other}"
            )))
        }
    };

    result.map_err(|e| PlatformError::Crypto(format!("AES decrypt failed: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use rsa::rand_core::OsRng;
    use rsa::RsaPublicKey;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    #[test]
    fn test_aes_round_trip_with_pkcs7_padding_left_in_place() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        // "token-value" plus PKCS#7 padding to one block
        let mut plaintext = b"token-value".to_vec();
        plaintext.extend(std::iter::repeat(5u8).take(5));

        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(&plaintext);

        let decrypted = aes_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes_rejects_partial_block() {
        let result = aes_cbc_decrypt(&[0u8; 16], &[0u8; 16], &[1, 2, 3]);
        assert!(matches!(result, Err(PlatformError::Crypto(_))));
    }

    #[test]
    fn test_aes_rejects_bad_key_length() {
        let result = aes_cbc_decrypt(&[0u8; 10], &[0u8; 16], &[0u8; 16]);
        assert!(matches!(result, Err(PlatformError::Crypto(_))));
    }

    #[test]
    fn test_rsa_round_trip() {
        let private_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let ciphertext = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, b"session-key-bytes")
            .unwrap();

        let crypto = SoftwareCrypto::new(private_key);
        assert_eq!(crypto.rsa_decrypt(&ciphertext).unwrap(), b"session-key-bytes");
    }

    #[test]
    fn test_rsa_without_key_fails() {
        let crypto = SoftwareCrypto::without_key();
        assert!(!crypto.has_key());
        assert!(matches!(
            crypto.rsa_decrypt(b"anything"),
            Err(PlatformError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_invalid_pem_rejected() {
        assert!(SoftwareCrypto::from_pem("not a key").is_err());
    }
}
