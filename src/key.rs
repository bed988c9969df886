//! Client key loading.

use std::fs;
use std::path::Path;

use log::debug;
use russh_keys::HashAlg;

use crate::error::TunnelError;

/// Read and parse the private key used to authenticate against the remote.
///
/// OpenSSH, PKCS#1 and PKCS#8 PEM encodings are accepted. Encrypted keys are
/// not supported since there is nobody to prompt for a passphrase.
pub fn load_private_key(key_path: &Path) -> Result<russh_keys::PrivateKey, TunnelError> {
    let key_data = fs::read_to_string(key_path).map_err(|e| {
        TunnelError::Credential(format!(
            "could not open key file {}: {}",
            key_path.display(),
            e
        ))
    })?;

    let key = russh_keys::decode_secret_key(&key_data, None).map_err(|e| {
        TunnelError::Credential(format!(
            "could not parse private key {}: {}",
            key_path.display(),
            e
        ))
    })?;

    debug!(
        "Loaded key {} with fingerprint {}",
        key_path.display(),
        key.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(key)
}
