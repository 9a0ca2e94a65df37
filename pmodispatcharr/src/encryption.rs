//! Password sealing for the configuration file
//!
//! A sealed value reads `encrypted:<base64(nonce || ciphertext)>`. It is
//! encrypted with AES-256-GCM under a key derived from the machine id, so
//! a `config.yaml` copied to another host cannot be opened there.
//!
//! The nonce is derived from the plaintext: sealing the same password twice
//! gives the same string.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::Engine;
use sha2::{Digest, Sha256};

const ENCRYPTED_PREFIX: &str = "encrypted:";
const KEY_SALT: &[u8] = b"pmodispatcharr-config-key-v1";
const NONCE_SALT: &[u8] = b"pmodispatcharr-config-nonce-v1";
const NONCE_LEN: usize = 12;

/// 256-bit key
pub type SealingKey = [u8; 32];

fn machine_id() -> Result<String> {
    #[cfg(target_os = "linux")]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(path) {
                let id = id.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        Err(anyhow!("no machine-id found"))
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("ioreg")
            .args(["-d2", "-c", "IOPlatformExpertDevice"])
            .output()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find(|line| line.contains("IOPlatformUUID"))
            .and_then(|line| line.split('"').nth(3))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("IOPlatformUUID not found"))
    }

    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("wmic")
            .args(["csproduct", "get", "UUID"])
            .output()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .nth(1)
            .map(|line| line.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("no UUID in wmic output"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(anyhow!("machine id unsupported on this platform"))
    }
}

/// Key derived from a machine identifier
pub fn derive_key(machine_id: &str) -> SealingKey {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(KEY_SALT);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Key of the current machine
pub fn machine_key() -> Result<SealingKey> {
    Ok(derive_key(&machine_id()?))
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Seals `plain` into an `encrypted:` value
pub fn seal(key: &SealingKey, plain: &str) -> Result<String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid key: {}", e))?;

    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hasher.update(NONCE_SALT);
    let digest = hasher.finalize();
    let nonce_bytes = &digest[..NONCE_LEN];

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce_bytes), plain.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {}", e))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{}{}",
        ENCRYPTED_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(&combined)
    ))
}

/// Opens an `encrypted:` value
pub fn open(key: &SealingKey, sealed: &str) -> Result<String> {
    let encoded = sealed
        .strip_prefix(ENCRYPTED_PREFIX)
        .ok_or_else(|| anyhow!("not an encrypted value"))?;
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("invalid base64: {}", e))?;
    if combined.len() <= NONCE_LEN {
        return Err(anyhow!("encrypted value too short"));
    }
    let (nonce, ciphertext) = combined.split_at(NONCE_LEN);

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid key: {}", e))?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failed (other machine or corrupted value)"))?;

    String::from_utf8(plain).map_err(|e| anyhow!("decrypted value is not UTF-8: {}", e))
}

/// Seals with the machine key
pub fn encrypt_password(plain: &str) -> Result<String> {
    seal(&machine_key()?, plain)
}

/// Plaintext of a stored password, sealed or not
pub fn reveal_password(value: &str) -> Result<String> {
    if is_encrypted(value) {
        open(&machine_key()?, value)
    } else {
        Ok(value.to_string())
    }
}
