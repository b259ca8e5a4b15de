use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScmError};

/// Fixed OAuth2 token endpoint for client-credentials grants.
pub const DEFAULT_AUTH_URL: &str =
    "https://auth.apps.paloaltonetworks.com/auth/v1/oauth2/access_token";

/// Body returned by the token endpoint, on success or failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub scope: String,

    #[serde(default)]
    pub token_type: String,

    #[serde(default)]
    pub expires_in: i64,

    #[serde(rename = "error", default)]
    pub err: String,

    #[serde(rename = "error_description", default)]
    pub err_desc: String,
}

impl AuthResponse {
    /// Classify a token endpoint answer.
    ///
    /// The endpoint reports bad credentials with either 400 or 401, so both
    /// are handled the same way. Every failure carries a message; the raw
    /// body rides along as detail when the server gave nothing structured.
    pub fn failed(&self, status: u16, body: &[u8]) -> Result<()> {
        match status {
            200 if !self.access_token.is_empty() => Ok(()),
            200 => Err(ScmError::auth(
                "auth succeeded but no token in response",
                body,
            )),
            400 | 401 if !self.err.is_empty() && !self.err_desc.is_empty() => {
                Err(ScmError::Auth {
                    message: format!("{}: {}", self.err, self.err_desc),
                    detail: None,
                })
            }
            400 | 401 => Err(ScmError::auth("Unauthorized", body)),
            _ => Err(ScmError::auth(
                "Unknown error, enable receive logging for more info",
                body,
            )),
        }
    }

    /// Turn a successful answer into a token stamped with the current time
    pub fn into_token(self) -> Token {
        Token {
            access_token: self.access_token,
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            scope: self.scope,
            expires_in: (self.expires_in > 0).then_some(self.expires_in),
            obtained_at: Utc::now(),
        }
    }
}

/// Token is the bearer credential attached to every API request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// JWT sent as `Authorization: Bearer <access_token>`
    pub access_token: String,

    /// Token type (usually "Bearer")
    pub token_type: String,

    /// Scope the token was granted for
    #[serde(default)]
    pub scope: String,

    /// Lifetime in seconds, when the issuer told us
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,

    /// When the token was received
    pub obtained_at: DateTime<Utc>,
}

impl Token {
    /// Wrap a JWT obtained out of band; its lifetime is unknown
    pub fn from_jwt(jwt: impl Into<String>) -> Self {
        Token {
            access_token: jwt.into(),
            token_type: "Bearer".to_string(),
            scope: String::new(),
            expires_in: None,
            obtained_at: Utc::now(),
        }
    }

    /// Expiry instant, if known
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| self.obtained_at + Duration::seconds(secs))
    }

    /// True once the known lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| Utc::now() >= at)
    }
}
