//! Access token claim decoding.
//!
//! Tokens are three dot-separated segments. Only the middle (claims) segment is
//! decoded; the signature is never checked here, the backend owns verification.
//! Decoded claims are advisory and only gate what the UI shows.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Number of dot-separated segments in a signed token
const TOKEN_SEGMENTS: usize = 3;

/// Camp staff role carried in the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Role {
    Admin,
    #[serde(rename = "Unit Head")]
    UnitHead,
    #[serde(rename = "Camper Care")]
    CamperCare,
    Counselor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::UnitHead => "Unit Head",
            Role::CamperCare => "Camper Care",
            Role::Counselor => "Counselor",
        }
    }

    /// Dashboard route a signed-in user of this role is sent to.
    pub fn home_route(&self) -> &'static str {
        match self {
            Role::UnitHead => "/unithead-dashboard",
            Role::CamperCare => "/campercare-dashboard",
            Role::Counselor => "/counselor-dashboard",
            Role::Admin => "/admin-dashboard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the current access token says the user is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub id: i64,
    pub role: Role,
    pub email: String,
}

/// Claims segment of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(alias = "id", deserialize_with = "deserialize_user_id")]
    pub user_id: i64,
    pub role: Role,
    pub email: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// A token is expired at its expiry instant, not only after it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => now >= expiry,
            None => true,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            id: self.user_id,
            role: self.role,
            email: self.email.clone(),
        }
    }
}

/// Simple JWT backends emit the user id either as a number or as a string.
fn deserialize_user_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("user id is not numeric: {:?}", text))),
    }
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("expected 3 segments, found {0}")]
    SegmentCount(usize),

    #[error("token has an empty segment")]
    EmptySegment,

    #[error("claims segment is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("claims segment is not valid claims JSON: {0}")]
    Claims(#[from] serde_json::Error),

    #[error("expiry {0} is out of range")]
    ExpiryOutOfRange(i64),
}

/// Outcome of decoding an access token.
#[derive(Debug)]
pub enum DecodeResult {
    Valid(Claims),
    Invalid(TokenError),
}

impl DecodeResult {
    pub fn into_result(self) -> Result<Claims, TokenError> {
        match self {
            DecodeResult::Valid(claims) => Ok(claims),
            DecodeResult::Invalid(reason) => Err(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, DecodeResult::Valid(_))
    }
}

/// Decode the claims of an access token without verifying its signature.
pub fn decode_claims(token: &str) -> DecodeResult {
    match try_decode(token) {
        Ok(claims) => DecodeResult::Valid(claims),
        Err(reason) => DecodeResult::Invalid(reason),
    }
}

fn try_decode(token: &str) -> Result<Claims, TokenError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != TOKEN_SEGMENTS {
        return Err(TokenError::SegmentCount(segments.len()));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TokenError::EmptySegment);
    }

    // Some issuers keep the '=' padding
    let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
    let claims: Claims = serde_json::from_slice(&payload)?;

    if claims.expires_at().is_none() {
        return Err(TokenError::ExpiryOutOfRange(claims.exp));
    }
    Ok(claims)
}
