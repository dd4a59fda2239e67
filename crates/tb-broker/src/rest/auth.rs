//! Bearer-token authentication
//!
//! Core operations trust the principal they are given; this extractor is
//! the only place a request becomes a principal.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use tb_core::{BrokerError, Principal};

use super::error::ApiError;
use crate::state::BrokerState;

/// The authenticated principal behind a request
#[derive(Debug, Clone)]
pub struct Caller(pub Principal);

impl Caller {
    /// Reject callers without admin rights
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.0.admin {
            Ok(())
        } else {
            Err(BrokerError::Unauthorized(format!("{} is not an admin", self.0)).into())
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<BrokerState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<BrokerState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".into()))?;
        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Unauthenticated("malformed Authorization header".into()))?;

        state
            .authenticate(token)
            .map(Caller)
            .ok_or_else(|| ApiError::Unauthenticated("unknown token".into()))
    }
}
