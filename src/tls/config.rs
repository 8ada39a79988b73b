use crate::config::{get_namespaced_string, optional};
use crate::error::Error;
use ::config::{Config, ConfigError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

const DEFAULT_SERVER_NAME: &str = "localhost";

/// TLS configuration shared by every connection of a dispatcher.
#[derive(Clone, Default)]
pub struct TlsSettings {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsSettings {
    /// Loads `tls_server_cert` + `tls_server_key` and `tls_ca_cert` if present.
    /// Both sides are optional; a dispatcher without them only runs plaintext.
    /// A certificate without a key (or the reverse) is an error.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let cert_path = optional(get_namespaced_string(config, name, "tls_server_cert"))?;
        let key_path = optional(get_namespaced_string(config, name, "tls_server_key"))?;
        let server = match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => {
                Some(Arc::new(load_tls_server_config(&cert_path, &key_path)?))
            }
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::NotFound("tls_server_key".into()).into()),
            (None, Some(_)) => return Err(ConfigError::NotFound("tls_server_cert".into()).into()),
        };

        let client = match optional(get_namespaced_string(config, name, "tls_ca_cert"))? {
            Some(ca_cert_path) => Some(Arc::new(load_tls_client_config(&ca_cert_path)?)),
            None => None,
        };

        let server_name = optional(get_namespaced_string(config, name, "tls_server_name"))?;

        Ok(Self {
            server,
            client,
            server_name,
        })
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    /// Overrides the SNI name sent by outbound connections.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        self.server.clone().ok_or(Error::TlsServerConfigMissing)
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        self.client.clone().ok_or(Error::TlsClientConfigMissing)
    }

    pub(crate) fn server_name(&self) -> Result<ServerName<'static>, Error> {
        let value = self
            .server_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        ServerName::try_from(value.clone()).map_err(|_| Error::TlsInvalidServerName(value))
    }
}

pub fn load_tls_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, Error> {
    let cert_file = File::open(cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: cert_path.to_string(),
        source: e,
    })?;
    let cert_chain: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.to_string(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))?;

    build_server_config(cert_chain, key)
}

/// Builds a server config from DER material already in memory.
pub fn build_server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, Error> {
    if cert_chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No certificates found".to_string(),
        ));
    }
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

pub fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let ca_cert_file = File::open(ca_cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: ca_cert_path.to_string(),
        source: e,
    })?;
    let ca_certs: Vec<CertificateDer> = certs(&mut BufReader::new(ca_cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::TlsInvalidCertificate(format!("Failed to parse CA certificates: {e}"))
        })?;

    build_client_config(ca_certs)
}

/// Builds a client config trusting exactly `ca_certs`.
pub fn build_client_config(ca_certs: Vec<CertificateDer<'static>>) -> Result<ClientConfig, Error> {
    if ca_certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No CA certificates found".to_string(),
        ));
    }

    let mut root_cert_store = RootCertStore::empty();
    for cert in ca_certs {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tls_keys_means_plaintext_only() {
        let config = Config::builder().build().unwrap();
        let settings = TlsSettings::from_config(&config, "").unwrap();
        assert!(!settings.has_server());
        assert!(!settings.has_client());
    }

    #[test]
    fn certificate_without_key_is_reported() {
        let config = Config::builder()
            .set_default("tls_server_cert", "/nonexistent/cert.pem")
            .unwrap()
            .build()
            .unwrap();
        match TlsSettings::from_config(&config, "smtp") {
            Err(Error::Config(ConfigError::NotFound(key))) => assert_eq!(key, "tls_server_key"),
            other => panic!("Expected missing key, got {other:?}"),
        }
    }

    #[test]
    fn key_without_certificate_is_reported() {
        let config = Config::builder()
            .set_default("smtp.tls_server_key", "/nonexistent/key.pem")
            .unwrap()
            .build()
            .unwrap();
        match TlsSettings::from_config(&config, "smtp") {
            Err(Error::Config(ConfigError::NotFound(key))) => assert_eq!(key, "tls_server_cert"),
            other => panic!("Expected missing certificate, got {other:?}"),
        }
    }
}
