use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::VaultError;
use crate::models::{EncryptionMetadata, FieldEncryption};

pub const ALGORITHM: &str = "aes-256-gcm";
pub const KDF: &str = "pbkdf2-sha256";
pub const PBKDF2_ITERATIONS: u32 = 210_000;
pub const MIN_MASTER_SECRET_LEN: usize = 32;
pub const MIN_REQUEST_ID_LEN: usize = 8;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const METADATA_VERSION: u32 = 1;

// values shipped in sample env files
const PLACEHOLDER_SECRETS: &[&str] = &[
    "your-encryption-master-key-here-min-32-chars",
    "your-secret-key-here",
    "change-me-to-a-long-random-secret-value",
    "changeme",
    "change-me",
    "default",
    "secret",
    "password",
];

#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub encrypted_tx_body: String,
    pub encrypted_witness_set: String,
    pub metadata: EncryptionMetadata,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DecryptedPayload {
    pub tx_body_hex: String,
    pub witness_set_hex: String,
}

impl std::fmt::Debug for DecryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecryptedPayload { .. }")
    }
}

/// Encrypts signed-but-unsubmitted transactions at rest.
///
/// Each request gets its own key, derived with PBKDF2-SHA256 from the
/// request id concatenated with the process master secret. Body and witness
/// set are sealed separately, each with a fresh salt and IV, and the request
/// id is bound as associated data.
pub struct PayloadVault {
    master_secret: Zeroizing<String>,
    iterations: u32,
}

impl PayloadVault {
    pub fn new(master_secret: Option<&str>) -> Result<Self, VaultError> {
        let secret = master_secret.ok_or(VaultError::MissingMasterSecret)?;
        Self::validate_master_secret(secret)?;

        Ok(Self {
            master_secret: Zeroizing::new(secret.to_string()),
            iterations: PBKDF2_ITERATIONS,
        })
    }

    fn validate_master_secret(secret: &str) -> Result<(), VaultError> {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return Err(VaultError::MissingMasterSecret);
        }

        let lowered = trimmed.to_lowercase();
        if PLACEHOLDER_SECRETS.iter().any(|p| lowered == *p)
            || lowered.starts_with("your-")
            || lowered.contains("placeholder")
        {
            return Err(VaultError::PlaceholderMasterSecret);
        }

        if trimmed.len() < MIN_MASTER_SECRET_LEN {
            return Err(VaultError::WeakMasterSecret {
                min: MIN_MASTER_SECRET_LEN,
                actual: trimmed.len(),
            });
        }

        Ok(())
    }

    pub fn encrypt(
        &self,
        request_id: &str,
        tx_body_hex: &str,
        witness_set_hex: &str,
    ) -> Result<EncryptedPayload, VaultError> {
        validate_request_id(request_id)?;
        validate_hex_field(tx_body_hex, "transaction body")?;
        validate_hex_field(witness_set_hex, "witness set")?;

        let (encrypted_tx_body, tx_body) = self.seal_field(request_id, tx_body_hex)?;
        let (encrypted_witness_set, witness_set) = self.seal_field(request_id, witness_set_hex)?;

        tracing::debug!(request_id = %request_id, "Encrypted signed payload");

        Ok(EncryptedPayload {
            encrypted_tx_body,
            encrypted_witness_set,
            metadata: EncryptionMetadata {
                algorithm: ALGORITHM.to_string(),
                kdf: KDF.to_string(),
                iterations: self.iterations,
                tx_body,
                witness_set,
                version: METADATA_VERSION,
            },
        })
    }

    pub fn decrypt(
        &self,
        request_id: &str,
        encrypted_tx_body: &str,
        encrypted_witness_set: &str,
        metadata: &EncryptionMetadata,
    ) -> Result<DecryptedPayload, VaultError> {
        validate_request_id(request_id)?;

        if metadata.algorithm != ALGORITHM {
            return Err(VaultError::UnsupportedAlgorithm(metadata.algorithm.clone()));
        }
        if metadata.kdf != KDF {
            return Err(VaultError::UnsupportedAlgorithm(metadata.kdf.clone()));
        }
        if metadata.iterations < PBKDF2_ITERATIONS {
            return Err(VaultError::IterationsTooLow(metadata.iterations));
        }

        let tx_body_hex = self.open_field(
            request_id,
            encrypted_tx_body,
            &metadata.tx_body,
            metadata.iterations,
        )?;
        let witness_set_hex = self.open_field(
            request_id,
            encrypted_witness_set,
            &metadata.witness_set,
            metadata.iterations,
        )?;

        Ok(DecryptedPayload {
            tx_body_hex,
            witness_set_hex,
        })
    }

    fn derive_key(&self, request_id: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
        let mut password = Zeroizing::new(Vec::with_capacity(request_id.len() + self.master_secret.len()));
        password.extend_from_slice(request_id.as_bytes());
        password.extend_from_slice(self.master_secret.as_bytes());

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha256>(&password, salt, iterations, &mut key[..]);
        key
    }

    fn seal_field(&self, request_id: &str, plaintext: &str) -> Result<(String, FieldEncryption), VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let key = self.derive_key(request_id, &salt, self.iterations);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| VaultError::Encryption)?;

        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: request_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Encryption)?;

        // aes-gcm appends the tag; it is stored next to the ciphertext
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok((
            hex::encode(&sealed),
            FieldEncryption {
                salt: hex::encode(salt),
                iv: hex::encode(iv),
                auth_tag: hex::encode(tag),
            },
        ))
    }

    fn open_field(
        &self,
        request_id: &str,
        ciphertext_hex: &str,
        params: &FieldEncryption,
        iterations: u32,
    ) -> Result<String, VaultError> {
        let salt = decode_hex(&params.salt, "salt")?;
        let iv = decode_hex(&params.iv, "iv")?;
        let tag = decode_hex(&params.auth_tag, "auth tag")?;
        let mut sealed = decode_hex(ciphertext_hex, "ciphertext")?;

        if iv.len() != IV_LEN {
            return Err(VaultError::Malformed(format!("iv must be {} bytes", IV_LEN)));
        }
        if tag.len() != TAG_LEN {
            return Err(VaultError::Malformed(format!("auth tag must be {} bytes", TAG_LEN)));
        }
        sealed.extend_from_slice(&tag);

        let key = self.derive_key(request_id, &salt, iterations);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| VaultError::Encryption)?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: request_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::AuthenticationFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Malformed("plaintext is not UTF-8".into()))
    }
}

fn validate_request_id(request_id: &str) -> Result<(), VaultError> {
    if request_id.len() < MIN_REQUEST_ID_LEN {
        return Err(VaultError::InvalidRequestId {
            min: MIN_REQUEST_ID_LEN,
        });
    }
    Ok(())
}

fn validate_hex_field(value: &str, field: &'static str) -> Result<(), VaultError> {
    if value.is_empty() {
        return Err(VaultError::EmptyPayload(field));
    }
    if value.len() % 2 != 0 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VaultError::Malformed(format!("{} is not hex", field)));
    }
    Ok(())
}

fn decode_hex(value: &str, field: &str) -> Result<Vec<u8>, VaultError> {
    hex::decode(value).map_err(|e| VaultError::Malformed(format!("{}: {}", field, e)))
}
