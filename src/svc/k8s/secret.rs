//! # Secret module
//!
//! This module provide the resolution of the password declared on the custom
//! resource, either through a kubernetes secret or inline with a base64 or
//! sm4 encoding

use base64::{engine::general_purpose::STANDARD, DecodeError, Engine};
use ecb::cipher::{
    block_padding::{Pkcs7, UnpadError},
    BlockDecryptMut, BlockEncryptMut, InvalidLength, KeyInit,
};

use crate::svc::{
    crd::redis::{Password, PasswordEncodeType, Redis},
    k8s::store::{self, Store},
    manifest,
};

// -----------------------------------------------------------------------------
// Constants

const SECRET_PASSWORD_KEY: &str = "password";

pub(crate) const SM4_KEY: &[u8] = b"@*H7*Xb%jBiDq*Mb";

type Sm4EcbEncryptor = ecb::Encryptor<sm4::Sm4>;
type Sm4EcbDecryptor = ecb::Decryptor<sm4::Sm4>;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Store(store::Error),
    #[error("secret '{0}' does not have a '{SECRET_PASSWORD_KEY}' field")]
    MissingPasswordKey(String),
    #[error("secret '{0}' could not be found")]
    SecretNotFound(String),
    #[error("failed to decode base64 password, {0}")]
    Base64Decode(DecodeError),
    #[error("failed to decode hexadecimal password, {0}")]
    HexDecode(hex::FromHexError),
    #[error("failed to initialize sm4 cipher, {0}")]
    Sm4Key(InvalidLength),
    #[error("failed to remove padding from sm4 plain text")]
    Sm4Unpad(UnpadError),
    #[error("failed to read password as utf-8, {0}")]
    Utf8(std::string::FromUtf8Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

// -----------------------------------------------------------------------------
// sm4 helpers

/// encrypts the given plain text with the operator sm4 key, the cipher text
/// is returned hexadecimal-encoded
pub fn encrypt_sm4(plain: &str) -> Result<String, Error> {
    let cipher = Sm4EcbEncryptor::new_from_slice(SM4_KEY).map_err(Error::Sm4Key)?;

    Ok(hex::encode(
        cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes()),
    ))
}

/// decrypts an hexadecimal-encoded sm4 cipher text with the operator sm4 key
pub fn decrypt_sm4(encoded: &str) -> Result<String, Error> {
    let data = hex::decode(encoded).map_err(Error::HexDecode)?;
    let cipher = Sm4EcbDecryptor::new_from_slice(SM4_KEY).map_err(Error::Sm4Key)?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(Error::Sm4Unpad)?;

    String::from_utf8(plain).map_err(Error::Utf8)
}

// -----------------------------------------------------------------------------
// Password resolution

/// decodes the inline password carried by the spec, the encode type defaults
/// to base64 when unspecified
pub fn decode_password(password: &Password) -> Result<String, Error> {
    match password.encode_type {
        PasswordEncodeType::Base64 => {
            let decoded = STANDARD
                .decode(&password.value)
                .map_err(Error::Base64Decode)?;

            String::from_utf8(decoded).map_err(Error::Utf8)
        }
        PasswordEncodeType::Sm4 => decrypt_sm4(&password.value),
    }
}

/// retrieves the password from the kubernetes secret referenced by the spec
/// or, if unspecified, decodes the inline value. A blank string means no
/// authentication at all.
pub async fn spec_password(store: &Store, rf: &Redis) -> Result<String, Error> {
    if !rf.spec.auth.secret_path.is_empty() {
        let namespace = manifest::rf_namespace(rf);
        let secret = store
            .get_secret(&namespace, &rf.spec.auth.secret_path)
            .await?
            .ok_or_else(|| Error::SecretNotFound(rf.spec.auth.secret_path.to_owned()))?;

        let password = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SECRET_PASSWORD_KEY))
            .ok_or_else(|| Error::MissingPasswordKey(rf.spec.auth.secret_path.to_owned()))?;

        return String::from_utf8(password.0.to_owned()).map_err(Error::Utf8);
    }

    if rf.spec.auth.password.value.is_empty() {
        return Ok(String::new());
    }

    decode_password(&rf.spec.auth.password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::redis::{Password, PasswordEncodeType};

    #[test]
    fn test_decode_base64_password() {
        let password = Password {
            encode_type: PasswordEncodeType::Base64,
            value: "cGFzcw==".into(),
        };

        assert_eq!(decode_password(&password).unwrap(), "pass");
    }

    #[test]
    fn test_decode_defaults_to_base64() {
        let password: Password = serde_json::from_str(r#"{"value": "cGFzcw=="}"#).unwrap();

        assert_eq!(decode_password(&password).unwrap(), "pass");
    }

    #[test]
    fn test_sm4_round_trip() {
        let encrypted = encrypt_sm4("HyxfHdIpiCui4jA").unwrap();

        assert_ne!(encrypted, "HyxfHdIpiCui4jA");
        assert_eq!(decrypt_sm4(&encrypted).unwrap(), "HyxfHdIpiCui4jA");
    }

    #[test]
    fn test_decode_sm4_password() {
        let password = Password {
            encode_type: PasswordEncodeType::Sm4,
            value: encrypt_sm4("pass").unwrap(),
        };

        assert_eq!(decode_password(&password).unwrap(), "pass");
    }

    #[test]
    fn test_decode_rejects_malformed_base64() {
        let password = Password {
            encode_type: PasswordEncodeType::Base64,
            value: "not base64 at all!".into(),
        };

        assert!(decode_password(&password).is_err());
    }
}
