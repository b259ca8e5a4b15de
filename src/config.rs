use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::auth::DEFAULT_AUTH_URL;
use crate::error::{Result, ScmError};
use crate::logging::LogLevel;

/// Default API host
pub const DEFAULT_HOST: &str = "api.strata.paloaltonetworks.com";

/// Default URL scheme
pub const DEFAULT_PROTOCOL: &str = "https";

/// Configuration for the SCM API client.
///
/// Every field is optional: whatever is left unset is filled in by
/// [`Config::resolve`] from the environment (when `check_environment` is
/// enabled), then from the JSON file at `auth_file`, then from defaults.
/// The JSON file uses this same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    /// URL scheme (http or https)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// OAuth2 token endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Extra headers sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Disable TLS certificate verification (development only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_verify_certificate: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogLevel>,

    /// Do not wrap the HTTP transport with the dumping logger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_logging_transport: Option<bool>,

    /// Pre-obtained bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,

    /// Path of a JSON credentials file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_file: Option<String>,

    /// Consult `SCM_*` environment variables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_environment: Option<bool>,
}

/// Fully resolved configuration, produced by [`Config::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: Option<u16>,
    pub protocol: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub skip_verify_certificate: bool,
    pub logging: LogLevel,
    pub skip_logging_transport: bool,
    pub jwt: Option<String>,
}

impl Settings {
    /// `protocol://host[:port]`
    pub fn api_prefix(&self) -> String {
        match self.port {
            Some(port) if port != 0 => format!("{}://{}:{}", self.protocol, self.host, port),
            _ => format!("{}://{}", self.protocol, self.host),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ScmError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            ScmError::Config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<Settings> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve using `lookup` in place of the process environment
    pub fn resolve_with<F>(&self, lookup: F) -> Result<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let check_env = self.check_environment.unwrap_or(false);
        let env = |name: &str| {
            if check_env {
                non_empty(lookup(name))
            } else {
                None
            }
        };

        let auth_file = non_empty(self.auth_file.clone()).or_else(|| env("SCM_AUTH_FILE"));
        let file = match auth_file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let host = first([non_empty(self.host.clone()), env("SCM_HOST"), non_empty(file.host)])
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = first([self.port, parse_env(env("SCM_PORT"), "SCM_PORT")?, file.port]);
        let port = match port {
            Some(p) => Some(
                u16::try_from(p)
                    .map_err(|_| ScmError::Config(format!("port {} is out of range 0-65535", p)))?,
            ),
            None => None,
        };

        let protocol = first([
            non_empty(self.protocol.clone()),
            env("SCM_PROTOCOL"),
            non_empty(file.protocol),
        ])
        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
        if protocol != "http" && protocol != "https" {
            return Err(ScmError::Config(format!("unsupported protocol {:?}", protocol)));
        }

        let auth_url = first([
            non_empty(self.auth_url.clone()),
            env("SCM_AUTH_URL"),
            non_empty(file.auth_url),
        ])
        .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string());

        let client_id = required(
            "client_id",
            [non_empty(self.client_id.clone()), env("SCM_CLIENT_ID"), non_empty(file.client_id)],
        )?;
        let client_secret = required(
            "client_secret",
            [
                non_empty(self.client_secret.clone()),
                env("SCM_CLIENT_SECRET"),
                non_empty(file.client_secret),
            ],
        )?;
        let scope = required(
            "scope",
            [non_empty(self.scope.clone()), env("SCM_SCOPE"), non_empty(file.scope)],
        )?;

        let env_headers = match env("SCM_HEADERS") {
            Some(raw) => Some(serde_json::from_str::<BTreeMap<String, String>>(&raw).map_err(
                |e| ScmError::Config(format!("SCM_HEADERS is not a JSON object of strings: {}", e)),
            )?),
            None => None,
        };
        let headers = first([self.headers.clone(), env_headers, file.headers]).unwrap_or_default();

        let user_agent = first([
            non_empty(self.user_agent.clone()),
            env("SCM_USER_AGENT"),
            non_empty(file.user_agent),
        ]);

        let skip_verify_certificate = first([
            self.skip_verify_certificate,
            parse_bool_env(env("SCM_SKIP_VERIFY_CERTIFICATE"), "SCM_SKIP_VERIFY_CERTIFICATE")?,
            file.skip_verify_certificate,
        ])
        .unwrap_or(false);

        let logging = first([
            self.logging,
            parse_env(env("SCM_LOGGING"), "SCM_LOGGING")?,
            file.logging,
        ])
        .unwrap_or_default();

        let skip_logging_transport = first([self.skip_logging_transport, file.skip_logging_transport])
            .unwrap_or(false);

        let jwt = first([non_empty(self.jwt.clone()), env("SCM_JWT"), non_empty(file.jwt)]);

        Ok(Settings {
            host,
            port,
            protocol,
            auth_url,
            client_id,
            client_secret,
            scope,
            headers,
            user_agent,
            skip_verify_certificate,
            logging,
            skip_logging_transport,
            jwt,
        })
    }
}

fn first<T, const N: usize>(sources: [Option<T>; N]) -> Option<T> {
    sources.into_iter().flatten().next()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required<const N: usize>(name: &str, sources: [Option<String>; N]) -> Result<String> {
    first(sources).ok_or_else(|| {
        ScmError::Config(format!(
            "{} is required: set it explicitly, in the config file, or via SCM_{}",
            name,
            name.to_ascii_uppercase()
        ))
    })
}

fn parse_env<T>(raw: Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| {
        v.trim()
            .parse::<T>()
            .map_err(|e| ScmError::Config(format!("invalid {} value {:?}: {}", name, v, e)))
    })
    .transpose()
}

fn parse_bool_env(raw: Option<String>, name: &str) -> Result<Option<bool>> {
    raw.map(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ScmError::Config(format!("invalid {} value {:?}", name, v))),
    })
    .transpose()
}
