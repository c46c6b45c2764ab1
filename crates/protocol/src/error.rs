//! Error types for the protocol crate.

use thiserror::Error;

use crate::keychain::KeychainError;

/// Protocol error type covering all possible failure modes.
///
/// Security-relevant variants ([`ProtocolError::Decryption`],
/// [`ProtocolError::KeyCommitment`]) carry constant messages so that a caller
/// cannot distinguish a wrong key from tampered data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("Encryption failed")]
    Encryption,

    /// Decryption failed: wrong key, tampered or truncated ciphertext.
    #[error("Decryption failed")]
    Decryption,

    /// Password-based key derivation could not run with the given parameters.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    // Channel errors
    /// Channel name does not match `^#[A-Za-z0-9_]+$`.
    #[error("Invalid channel name: {0}")]
    InvalidChannelName(String),

    /// A password-protected channel was joined without a password.
    #[error("Password required for {0}")]
    PasswordRequired(String),

    /// The password-derived key does not match the channel's key commitment.
    #[error("Key commitment verification failed for {0}")]
    KeyCommitment(String),

    /// Caller is not the channel creator.
    #[error("Only creator can {action} {channel}")]
    PermissionDenied {
        /// The attempted action, phrased to precede the channel name.
        action: &'static str,
        /// The channel the action targeted.
        channel: String,
    },

    /// The channel has never been created or seen.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// No key is known for the channel.
    #[error("no key available for {0}")]
    MissingChannelKey(String),

    // Argument errors
    /// An argument failed validation.
    #[error("{0}")]
    InvalidArgument(String),

    // Collaborator errors
    /// The keychain collaborator failed.
    #[error("keychain error: {0}")]
    Keychain(#[from] KeychainError),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Shorthand for an [`ProtocolError::InvalidArgument`] with a static message.
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ProtocolError::InvalidArgument(message.into())
    }
}

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<argon2::Error> for ProtocolError {
    fn from(err: argon2::Error) -> Self {
        ProtocolError::KeyDerivation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_error_is_constant() {
        let err = ProtocolError::Decryption;
        assert_eq!(err.to_string(), "Decryption failed");
    }

    #[test]
    fn test_invalid_channel_name_display() {
        let err = ProtocolError::InvalidChannelName("#invalid-channel!".to_string());
        assert_eq!(err.to_string(), "Invalid channel name: #invalid-channel!");
    }

    #[test]
    fn test_key_commitment_display() {
        let err = ProtocolError::KeyCommitment("#secret".to_string());
        assert_eq!(
            err.to_string(),
            "Key commitment verification failed for #secret"
        );
    }

    #[test]
    fn test_permission_denied_display() {
        let err = ProtocolError::PermissionDenied {
            action: "set password for",
            channel: "#secret".to_string(),
        };
        assert_eq!(err.to_string(), "Only creator can set password for #secret");

        let err = ProtocolError::PermissionDenied {
            action: "transfer ownership of",
            channel: "#secret".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Only creator can transfer ownership of #secret"
        );
    }

    #[test]
    fn test_invalid_argument_display_is_bare() {
        let err = ProtocolError::invalid("nickname cannot be empty");
        assert_eq!(err.to_string(), "nickname cannot be empty");
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_keychain_error() {
        let err: ProtocolError = KeychainError::AccessDenied("locked".to_string()).into();
        assert!(matches!(err, ProtocolError::Keychain(_)));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
