// AES-CBC decryption of message bodies.
// The session may carry the AES key in the clear or RSA-wrapped with the
// agent's public key; wrapped keys are unwrapped per message with the
// private key from the local key store and never persisted.

use crate::agent_server::{TaskAgentMessage, TaskAgentSession};
use aes::{Aes128, Aes192, Aes256};
use base64::prelude::*;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;
use thiserror::Error;

/// Failures of the message decryption pipeline.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("message body is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("failed to unwrap the session encryption key: {0}")]
    KeyUnwrap(String),

    #[error("unsupported AES key length: {0} bytes")]
    UnsupportedKeyLength(usize),

    #[error("invalid initialization vector length: {0} bytes")]
    InvalidIvLength(usize),

    #[error("ciphertext is not valid AES-CBC/PKCS#7 under the session key")]
    InvalidCiphertext,

    #[error("decrypted body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Source of the agent's private RSA key.
pub trait RsaKeyStore: Send + Sync {
    fn private_key(&self) -> anyhow::Result<RsaPrivateKey>;
}

/// Decrypt a message body with the session key.
///
/// When the session has no key, or the message carries no IV, the body is
/// returned as-is. The session itself is never mutated: an RSA-wrapped key
/// is unwrapped into a local buffer scoped to this call.
pub fn decrypt_message(
    session: &TaskAgentSession,
    message: TaskAgentMessage,
    keys: &dyn RsaKeyStore,
) -> Result<TaskAgentMessage, DecryptionError> {
    let (key, iv) = match (session.encryption_key.as_ref(), message.iv.as_ref()) {
        (Some(key), Some(iv)) if !key.value.is_empty() => (key, iv.clone()),
        _ => return Ok(message),
    };

    let aes_key: Vec<u8> = if key.encrypted {
        let private_key = keys
            .private_key()
            .map_err(|e| DecryptionError::KeyUnwrap(e.to_string()))?;
        private_key
            .decrypt(Oaep::new::<Sha1>(), &key.value)
            .map_err(|e| DecryptionError::KeyUnwrap(e.to_string()))?
    } else {
        key.value.clone()
    };

    let ciphertext = BASE64_STANDARD.decode(message.body.as_bytes())?;
    let plaintext = aes_cbc_decrypt(&aes_key, &iv, &ciphertext)?;
    let body = String::from_utf8(plaintext)?;

    Ok(TaskAgentMessage { body, ..message })
}

/// AES-CBC/PKCS#7 decryption dispatched on key length.
fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
    if iv.len() != 16 {
        return Err(DecryptionError::InvalidIvLength(iv.len()));
    }

    let plaintext = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| DecryptionError::UnsupportedKeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| DecryptionError::UnsupportedKeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| DecryptionError::UnsupportedKeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        other => return Err(DecryptionError::UnsupportedKeyLength(other)),
    };

    plaintext.map_err(|_| DecryptionError::InvalidCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_server::SessionEncryptionKey;
    use crate::agent_server::TaskAgentReference;
    use cbc::cipher::BlockEncryptMut;
    use rsa::RsaPublicKey;
    use std::collections::HashMap;
    use uuid::Uuid;

    struct NoKeys;
    impl RsaKeyStore for NoKeys {
        fn private_key(&self) -> anyhow::Result<RsaPrivateKey> {
            anyhow::bail!("no key configured")
        }
    }

    struct FixedKey(RsaPrivateKey);
    impl RsaKeyStore for FixedKey {
        fn private_key(&self) -> anyhow::Result<RsaPrivateKey> {
            Ok(self.0.clone())
        }
    }

    fn session_with_key(key: Option<SessionEncryptionKey>) -> TaskAgentSession {
        TaskAgentSession {
            session_id: Uuid::new_v4(),
            owner_name: "host".into(),
            agent: TaskAgentReference {
                id: 1,
                name: "agent-1".into(),
                version: "1.0.0".into(),
                os_description: "Linux X64".into(),
            },
            capabilities: HashMap::new(),
            encryption_key: key,
        }
    }

    fn message(body: String, iv: Option<Vec<u8>>) -> TaskAgentMessage {
        TaskAgentMessage {
            message_id: 1,
            message_type: "JobRequest".into(),
            body,
            iv,
        }
    }

    fn encrypt_body(key: &[u8], iv: &[u8; 16], plaintext: &[u8]) -> String {
        let ciphertext = match key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .unwrap()
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .unwrap()
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => panic!("unsupported test key length"),
        };
        BASE64_STANDARD.encode(ciphertext)
    }

    #[test]
    fn no_session_key_is_identity() {
        let session = session_with_key(None);
        let input = message("plain body".into(), Some(vec![0u8; 16]));
        let output = decrypt_message(&session, input.clone(), &NoKeys).unwrap();
        assert_eq!(output.body, "plain body");
    }

    #[test]
    fn no_iv_is_identity() {
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: vec![7u8; 32],
        }));
        let input = message("still plain".into(), None);
        let output = decrypt_message(&session, input, &NoKeys).unwrap();
        assert_eq!(output.body, "still plain");
    }

    #[test]
    fn decrypts_with_clear_aes256_key() {
        let key = [0x42u8; 32];
        let iv = [0x17u8; 16];
        let plaintext = r#"{"jobId":"a1","steps":3}"#;

        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: key.to_vec(),
        }));
        let input = message(encrypt_body(&key, &iv, plaintext.as_bytes()), Some(iv.to_vec()));

        let output = decrypt_message(&session, input, &NoKeys).unwrap();
        assert_eq!(output.body, plaintext);
        assert_eq!(output.message_id, 1);
    }

    #[test]
    fn decrypts_with_clear_aes128_key() {
        let key = [9u8; 16];
        let iv = [3u8; 16];
        let plaintext = "short";

        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: key.to_vec(),
        }));
        let input = message(encrypt_body(&key, &iv, plaintext.as_bytes()), Some(iv.to_vec()));

        let output = decrypt_message(&session, input, &NoKeys).unwrap();
        assert_eq!(output.body, plaintext);
    }

    #[test]
    fn unwraps_rsa_wrapped_key() {
        let mut rng = rand::thread_rng();
        // Small key keeps the test fast; production keys are 2048-bit.
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let aes_key = [0x5au8; 32];
        let iv = [0x0fu8; 16];
        let wrapped = public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &aes_key)
            .unwrap();

        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: true,
            value: wrapped,
        }));
        let input = message(
            encrypt_body(&aes_key, &iv, b"wrapped-key payload"),
            Some(iv.to_vec()),
        );

        let output = decrypt_message(&session, input, &FixedKey(private_key)).unwrap();
        assert_eq!(output.body, "wrapped-key payload");
    }

    #[test]
    fn wrapped_key_without_local_key_fails() {
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: true,
            value: vec![1u8; 128],
        }));
        let input = message("aGVsbG8=".into(), Some(vec![0u8; 16]));
        let error = decrypt_message(&session, input, &NoKeys).unwrap_err();
        assert!(matches!(error, DecryptionError::KeyUnwrap(_)));
    }

    #[test]
    fn session_untouched_by_decryption() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: key.to_vec(),
        }));
        let input = message(encrypt_body(&key, &iv, b"x"), Some(iv.to_vec()));
        let _ = decrypt_message(&session, input, &NoKeys).unwrap();

        let still = session.encryption_key.as_ref().unwrap();
        assert!(!still.encrypted);
        assert_eq!(still.value, key.to_vec());
    }

    #[test]
    fn bad_key_length_rejected() {
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: vec![1u8; 20],
        }));
        let input = message("aGVsbG8=".into(), Some(vec![0u8; 16]));
        let error = decrypt_message(&session, input, &NoKeys).unwrap_err();
        assert!(matches!(error, DecryptionError::UnsupportedKeyLength(20)));
    }

    #[test]
    fn bad_iv_length_rejected() {
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: vec![1u8; 32],
        }));
        let input = message("aGVsbG8=".into(), Some(vec![0u8; 8]));
        let error = decrypt_message(&session, input, &NoKeys).unwrap_err();
        assert!(matches!(error, DecryptionError::InvalidIvLength(8)));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let session = session_with_key(Some(SessionEncryptionKey {
            encrypted: false,
            value: key.to_vec(),
        }));
        // Valid base64 of bytes that are not a whole cipher block.
        let input = message(BASE64_STANDARD.encode([0u8; 7]), Some(iv.to_vec()));
        let error = decrypt_message(&session, input, &NoKeys).unwrap_err();
        assert!(matches!(error, DecryptionError::InvalidCiphertext));
    }
}
