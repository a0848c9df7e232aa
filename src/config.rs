use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Server settings, read from `SALOND_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "salond".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; set but
    /// unparsable numbers are an error rather than a silent default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let mut config = Config::default();
        if let Some(port) = parsed(&lookup, "SALOND_PORT")? {
            config.port = port;
        }
        if let Some(bind) = lookup("SALOND_BIND") {
            config.bind = bind;
        }
        if let Some(dir) = lookup("SALOND_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = lookup("SALOND_PASSWORD") {
            config.password = password;
        }
        if let Some(max) = parsed(&lookup, "SALOND_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(threshold) = parsed(&lookup, "SALOND_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        config.metrics_port = parsed(&lookup, "SALOND_METRICS_PORT")?;
        config.tls_cert = lookup("SALOND_TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("SALOND_TLS_KEY").map(PathBuf::from);

        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SALOND_TLS_CERT and SALOND_TLS_KEY must be set, or neither",
            ));
        }
        if config.max_connections == 0 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "SALOND_MAX_CONNECTIONS must be positive"));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// rustls acceptor for the configured certificate pair, if any.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("{key}: bad value {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> io::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert!(c.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_from_env() {
        let c = config(&[
            ("SALOND_PORT", "6000"),
            ("SALOND_BIND", "127.0.0.1"),
            ("SALOND_DATA_DIR", "/var/lib/salond"),
            ("SALOND_PASSWORD", "s3cret"),
            ("SALOND_MAX_CONNECTIONS", "8"),
            ("SALOND_COMPACT_THRESHOLD", "50"),
            ("SALOND_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/salond"));
        assert_eq!(c.password, "s3cret");
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(config(&[("SALOND_PORT", "http")]).is_err());
        assert!(config(&[("SALOND_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn tls_pair_must_be_complete() {
        let err = config(&[("SALOND_TLS_CERT", "cert.pem")]).unwrap_err();
        assert!(err.to_string().contains("SALOND_TLS_KEY"));
    }

    #[test]
    fn missing_tls_files_fail_to_load() {
        let c = config(&[
            ("SALOND_TLS_CERT", "/nonexistent/cert.pem"),
            ("SALOND_TLS_KEY", "/nonexistent/key.pem"),
        ])
        .unwrap();
        assert!(c.tls_acceptor().is_err());
    }
}
