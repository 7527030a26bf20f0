// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Identity tokens and server certificate validation.
//!
//! Both are capabilities handed to the session state machine:
//! [`IdentityProvider`] is asked for a token once per ActivateSession, and
//! [`CertificateValidator`] checks the certificate returned by CreateSession
//! when the endpoint is secured.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{OpcUaResult, SecurityError};
use crate::message::{IdentityToken, SignatureData};
use crate::types::EndpointDescription;

// =============================================================================
// IdentityProvider
// =============================================================================

/// Supplies the user identity for ActivateSession.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the provider name.
    fn name(&self) -> &str;

    /// Builds the identity token and its signature for `endpoint`.
    async fn identity_token(
        &self,
        endpoint: &EndpointDescription,
        server_nonce: &[u8],
    ) -> OpcUaResult<(IdentityToken, SignatureData)>;
}

/// Anonymous identity.
#[derive(Debug, Clone)]
pub struct AnonymousProvider {
    policy_id: String,
}

impl AnonymousProvider {
    /// Uses the conventional `anonymous` policy id.
    pub fn new() -> Self {
        Self {
            policy_id: "anonymous".to_string(),
        }
    }
}

impl Default for AnonymousProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for AnonymousProvider {
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn identity_token(
        &self,
        _endpoint: &EndpointDescription,
        _server_nonce: &[u8],
    ) -> OpcUaResult<(IdentityToken, SignatureData)> {
        Ok((
            IdentityToken::Anonymous {
                policy_id: self.policy_id.clone(),
            },
            SignatureData::default(),
        ))
    }
}

/// User name and password identity.
///
/// The password is sent as-is; encrypting it for a secured policy belongs to
/// the transport's crypto layer.
#[derive(Clone)]
pub struct UsernameProvider {
    policy_id: String,
    user_name: String,
    password: String,
}

impl UsernameProvider {
    /// Creates a provider for `user_name`.
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            policy_id: "username".to_string(),
            user_name: user_name.into(),
            password: password.into(),
        }
    }

    /// Overrides the user token policy id.
    pub fn with_policy_id(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = policy_id.into();
        self
    }
}

impl fmt::Debug for UsernameProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernameProvider")
            .field("policy_id", &self.policy_id)
            .field("user_name", &self.user_name)
            .field("password", &"***")
            .finish()
    }
}

#[async_trait]
impl IdentityProvider for UsernameProvider {
    fn name(&self) -> &str {
        "username"
    }

    async fn identity_token(
        &self,
        _endpoint: &EndpointDescription,
        _server_nonce: &[u8],
    ) -> OpcUaResult<(IdentityToken, SignatureData)> {
        if self.user_name.is_empty() {
            return Err(SecurityError::identity("user name is empty").into());
        }
        Ok((
            IdentityToken::UserName {
                policy_id: self.policy_id.clone(),
                user_name: self.user_name.clone(),
                password: self.password.as_bytes().to_vec(),
                encryption_algorithm: None,
            },
            SignatureData::default(),
        ))
    }
}

// =============================================================================
// CertificateValidator
// =============================================================================

/// Validates the server certificate chain.
#[async_trait]
pub trait CertificateValidator: Send + Sync {
    /// Returns the validator name.
    fn name(&self) -> &str;

    /// Validates a DER-encoded chain, leaf first.
    async fn validate(&self, chain: &[Vec<u8>]) -> OpcUaResult<()>;
}

/// Accepts every certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureValidator;

#[async_trait]
impl CertificateValidator for InsecureValidator {
    fn name(&self) -> &str {
        "insecure"
    }

    async fn validate(&self, _chain: &[Vec<u8>]) -> OpcUaResult<()> {
        Ok(())
    }
}

/// Function computing a certificate thumbprint from DER bytes.
pub type ThumbprintFn = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Accepts a chain whose leaf thumbprint was explicitly trusted.
pub struct ThumbprintValidator {
    thumbprint: ThumbprintFn,
    trusted: RwLock<HashSet<String>>,
}

impl ThumbprintValidator {
    /// Creates a validator that derives thumbprints with `thumbprint`.
    pub fn new(thumbprint: ThumbprintFn) -> Self {
        Self {
            thumbprint,
            trusted: RwLock::new(HashSet::new()),
        }
    }

    /// Trusts a thumbprint (case-insensitive hex).
    pub fn trust(&self, thumbprint: impl AsRef<str>) {
        self.trusted
            .write()
            .insert(thumbprint.as_ref().to_uppercase());
    }

    /// Removes a trusted thumbprint.
    pub fn revoke(&self, thumbprint: impl AsRef<str>) -> bool {
        self.trusted
            .write()
            .remove(&thumbprint.as_ref().to_uppercase())
    }
}

impl fmt::Debug for ThumbprintValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbprintValidator")
            .field("trusted", &self.trusted.read().len())
            .finish()
    }
}

#[async_trait]
impl CertificateValidator for ThumbprintValidator {
    fn name(&self) -> &str {
        "thumbprint"
    }

    async fn validate(&self, chain: &[Vec<u8>]) -> OpcUaResult<()> {
        let leaf = chain
            .first()
            .filter(|der| !der.is_empty())
            .ok_or_else(|| SecurityError::certificate("server sent no certificate"))?;

        let thumbprint = (self.thumbprint)(leaf).to_uppercase();
        if self.trusted.read().contains(&thumbprint) {
            Ok(())
        } else {
            Err(SecurityError::certificate(format!("thumbprint {thumbprint} is not trusted")).into())
        }
    }
}

/// Uppercase hex encoding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpcUaError;
    use crate::types::StatusCode;

    #[tokio::test]
    async fn test_anonymous_token() {
        let (token, signature) = AnonymousProvider::new()
            .identity_token(&EndpointDescription::default(), b"nonce")
            .await
            .unwrap();
        assert_eq!(
            token,
            IdentityToken::Anonymous {
                policy_id: "anonymous".into()
            }
        );
        assert!(signature.signature.is_empty());
    }

    #[tokio::test]
    async fn test_username_token() {
        let provider = UsernameProvider::new("operator", "secret");
        let (token, _) = provider
            .identity_token(&EndpointDescription::default(), &[])
            .await
            .unwrap();
        match token {
            IdentityToken::UserName {
                user_name, password, ..
            } => {
                assert_eq!(user_name, "operator");
                assert_eq!(password, b"secret".to_vec());
            }
            other => panic!("unexpected token {other:?}"),
        }
        assert!(!format!("{provider:?}").contains("secret"));

        let empty = UsernameProvider::new("", "x");
        assert!(empty
            .identity_token(&EndpointDescription::default(), &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_thumbprint_validator() {
        let validator = ThumbprintValidator::new(Arc::new(|der: &[u8]| hex_encode(&der[..2])));
        let chain = vec![vec![0xAB, 0xCD, 0x01]];

        let err = validator.validate(&chain).await.unwrap_err();
        assert!(matches!(err, OpcUaError::Security(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_SECURITY_CHECKS_FAILED);

        validator.trust("abcd");
        assert!(validator.validate(&chain).await.is_ok());
        assert!(validator.validate(&[]).await.is_err());

        assert!(validator.revoke("ABCD"));
        assert!(validator.validate(&chain).await.is_err());
    }
}
