//! WhatsApp end-to-end media decryption.
//!
//! Media blobs are AES-256-CBC encrypted with keys expanded from the
//! per-message `mediaKey` (HKDF-SHA256, 112 bytes: IV, cipher key, MAC key,
//! ref key). The blob is `ciphertext || mac[..10]`, where the MAC is
//! HMAC-SHA256 over `iv || ciphertext`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zaprelay_core::error::RelayError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 10;
const EXPANDED_LEN: usize = 112;

/// Which HKDF info string a payload was encrypted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaClass {
    /// Classify by MIME type. Stickers (`image/webp`) use image keys.
    pub fn from_mime(mime: &str) -> Self {
        let major = mime.split('/').next().unwrap_or("").trim().to_ascii_lowercase();
        match major.as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }

    fn info(&self) -> &'static [u8] {
        match self {
            Self::Image => b"WhatsApp Image Keys",
            Self::Video => b"WhatsApp Video Keys",
            Self::Audio => b"WhatsApp Audio Keys",
            Self::Document => b"WhatsApp Document Keys",
        }
    }
}

struct MediaKeys {
    iv: [u8; 16],
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

fn expand_keys(media_key: &[u8], class: MediaClass) -> Result<MediaKeys, RelayError> {
    let hk = Hkdf::<Sha256>::new(None, media_key);
    let mut okm = [0u8; EXPANDED_LEN];
    hk.expand(class.info(), &mut okm)
        .map_err(|e| RelayError::Channel(format!("media key expansion failed: {e}")))?;

    let mut keys = MediaKeys {
        iv: [0; 16],
        cipher_key: [0; 32],
        mac_key: [0; 32],
    };
    keys.iv.copy_from_slice(&okm[..16]);
    keys.cipher_key.copy_from_slice(&okm[16..48]);
    keys.mac_key.copy_from_slice(&okm[48..80]);
    Ok(keys)
}

/// Decrypt a downloaded media blob with its base64 media key.
pub fn decrypt_media(blob: &[u8], media_key_b64: &str, class: MediaClass) -> Result<Vec<u8>, RelayError> {
    let media_key = BASE64
        .decode(media_key_b64.trim())
        .map_err(|e| RelayError::Channel(format!("invalid media key: {e}")))?;
    if blob.len() <= MAC_LEN {
        return Err(RelayError::Channel(format!(
            "media blob too short ({} bytes)",
            blob.len()
        )));
    }

    let keys = expand_keys(&media_key, class)?;
    let (ciphertext, tag) = blob.split_at(blob.len() - MAC_LEN);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.mac_key)
        .map_err(|e| RelayError::Channel(format!("media mac init failed: {e}")))?;
    mac.update(&keys.iv);
    mac.update(ciphertext);
    mac.verify_truncated_left(tag)
        .map_err(|_| RelayError::Channel("media mac mismatch".into()))?;

    Aes256CbcDec::new(&keys.cipher_key.into(), &keys.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| RelayError::Channel(format!("media decryption failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    /// Encrypt the way the sender's client does, for fixtures.
    fn encrypt_media(plain: &[u8], media_key: &[u8], class: MediaClass) -> Vec<u8> {
        let keys = expand_keys(media_key, class).unwrap();
        let mut out = Aes256CbcEnc::new(&keys.cipher_key.into(), &keys.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.mac_key).unwrap();
        mac.update(&keys.iv);
        mac.update(&out);
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..MAC_LEN]);
        out
    }

    #[test]
    fn test_decrypts_sender_encrypted_audio() {
        let media_key = [7u8; 32];
        let plain = b"OggS fake opus payload of some length".to_vec();
        let blob = encrypt_media(&plain, &media_key, MediaClass::Audio);

        let out = decrypt_media(&blob, &BASE64.encode(media_key), MediaClass::Audio).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_wrong_class_fails_mac() {
        let media_key = [9u8; 32];
        let blob = encrypt_media(b"jpeg bytes", &media_key, MediaClass::Image);
        let err = decrypt_media(&blob, &BASE64.encode(media_key), MediaClass::Audio).unwrap_err();
        assert!(err.to_string().contains("mac mismatch"));
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let media_key = [1u8; 32];
        let mut blob = encrypt_media(b"document", &media_key, MediaClass::Document);
        blob[0] ^= 0xff;
        assert!(decrypt_media(&blob, &BASE64.encode(media_key), MediaClass::Document).is_err());
    }

    #[test]
    fn test_short_blob_and_bad_key() {
        assert!(decrypt_media(&[0u8; 4], &BASE64.encode([0u8; 32]), MediaClass::Image).is_err());
        assert!(decrypt_media(&[0u8; 64], "%%%not-base64", MediaClass::Image).is_err());
    }

    #[test]
    fn test_class_from_mime() {
        assert_eq!(MediaClass::from_mime("audio/ogg; codecs=opus"), MediaClass::Audio);
        assert_eq!(MediaClass::from_mime("image/webp"), MediaClass::Image);
        assert_eq!(MediaClass::from_mime("application/pdf"), MediaClass::Document);
    }
}
