//! Session verification in front of the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

/// Decides whether a request may enter the pipeline.
#[async_trait]
pub trait SessionGate: Send + Sync {
    async fn is_authenticated(&self, headers: &HeaderMap) -> bool;
}

/// Lets every request through. Used when no tokens are configured.
pub struct OpenGate;

#[async_trait]
impl SessionGate for OpenGate {
    async fn is_authenticated(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Accepts `Authorization: Bearer <token>` for any configured token.
///
/// Configured tokens are kept only as HMAC-SHA256 tags under a per-process
/// key. A presented token is tagged the same way and checked against every
/// tag with [`Mac::verify_slice`], which compares in constant time.
pub struct BearerTokenGate {
    key: [u8; 16],
    tags: Vec<Vec<u8>>,
}

impl BearerTokenGate {
    pub fn new(tokens: Vec<String>) -> Self {
        let key = *Uuid::new_v4().as_bytes();
        let tags = tokens
            .iter()
            .filter_map(|token| token_mac(&key, token))
            .map(|mac| mac.finalize().into_bytes().to_vec())
            .collect();
        Self { key, tags }
    }

    fn accepts(&self, token: &str) -> bool {
        // No early exit: every tag is checked.
        self.tags.iter().fold(false, |accepted, tag| {
            let matched = token_mac(&self.key, token)
                .is_some_and(|mac| mac.verify_slice(tag).is_ok());
            accepted | matched
        })
    }
}

fn token_mac(key: &[u8], token: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(token.as_bytes());
    Some(mac)
}

#[async_trait]
impl SessionGate for BearerTokenGate {
    async fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        match value.strip_prefix("Bearer ") {
            Some(token) => self.accepts(token.trim()),
            None => false,
        }
    }
}

pub fn gate_from_config(config: &AuthConfig) -> Arc<dyn SessionGate> {
    if config.is_enabled() {
        Arc::new(BearerTokenGate::new(config.tokens.clone()))
    } else {
        Arc::new(OpenGate)
    }
}
