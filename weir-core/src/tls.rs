use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::AnyResult;

/// TLS listener configuration: paths to a PEM certificate chain and a
/// PKCS#8 private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub chain: PathBuf,
    pub key: PathBuf,
}

impl TlsConfig {
    /// Reads the chain and key files and builds a server identity.
    pub fn load_identity(&self) -> AnyResult<native_tls::Identity> {
        let chain = std::fs::read(&self.chain)?;
        let key = std::fs::read(&self.key)?;
        Ok(native_tls::Identity::from_pkcs8(&chain, &key)?)
    }
}
