//! Client configuration: proxy credentials, TLS verification policy and the
//! rc-file consumed by the client under test.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

use crate::error::Result;
use crate::sandbox::Environment;
use crate::util::{absolute_path, unique_suffix, write_string};

/// Basic proxy credentials, stored decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuthSpec {
    pub username: String,
    pub password: String,
}

impl ProxyAuthSpec {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `user:pass` exactly as the proxy expects it on its command line.
    #[must_use]
    pub fn proxyauth_arg(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Userinfo component for embedding in a URL.
    #[must_use]
    pub fn userinfo(&self) -> String {
        format!(
            "{}:{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsVerifyMode {
    Disabled,
    VerifyWithCertificate(PathBuf),
}

impl TlsVerifyMode {
    /// Value of the `ssl_verify` key.
    #[must_use]
    pub fn as_config_value(&self) -> String {
        match self {
            Self::Disabled => "false".to_string(),
            Self::VerifyWithCertificate(path) => path.display().to_string(),
        }
    }

    /// Same mode with the certificate path anchored at the working
    /// directory. The client resolves relative paths against its own.
    pub fn into_absolute(self) -> Result<Self> {
        match self {
            Self::Disabled => Ok(Self::Disabled),
            Self::VerifyWithCertificate(path) => {
                Ok(Self::VerifyWithCertificate(absolute_path(&path)?))
            }
        }
    }
}

impl Serialize for TlsVerifyMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Disabled => serializer.serialize_bool(false),
            Self::VerifyWithCertificate(path) => path.serialize(serializer),
        }
    }
}

/// Proxy URL for a local proxy listening on `port`.
#[must_use]
pub fn proxy_url(port: u16, auth: Option<&ProxyAuthSpec>) -> String {
    match auth {
        Some(auth) => format!("http://{}@localhost:{port}", auth.userinfo()),
        None => format!("http://localhost:{port}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConfig {
    pub proxy_url_http: String,
    pub proxy_url_https: String,
    pub ssl_verify: TlsVerifyMode,
}

impl ClientConfig {
    /// A single proxy instance serves both the plain and the TLS role.
    #[must_use]
    pub fn new(proxy_url: &str, verify: TlsVerifyMode) -> Self {
        Self {
            proxy_url_http: proxy_url.to_string(),
            proxy_url_https: proxy_url.to_string(),
            ssl_verify: verify,
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        [
            "proxy_servers:".to_string(),
            format!("    http: {}", self.proxy_url_http),
            format!("    https: {}", self.proxy_url_https),
            format!("ssl_verify: {}", self.ssl_verify.as_config_value()),
        ]
        .join("\n")
    }
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Write a fresh rc-file into the environment prefix and return its path.
pub fn write_client_config(
    env: &Environment,
    proxy_url: &str,
    verify: TlsVerifyMode,
) -> Result<PathBuf> {
    let path = env.prefix_path.join(format!("{}.yaml", unique_suffix()));
    write_config_to(&path, &ClientConfig::new(proxy_url, verify.into_absolute()?))?;
    Ok(path)
}

pub fn write_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    tracing::debug!(path = %path.display(), ssl_verify = %config.ssl_verify.as_config_value(), "writing client config");
    write_string(path, &config.render())
}
