// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::TlsConfig;
use crate::{AppError, AppResult};

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Builds the acceptor from the configured PEM files, generating a self-signed pair
/// when neither file exists.
pub fn load_tls_acceptor(tls: &TlsConfig) -> AppResult<TlsAcceptor> {
    let crt_path = Path::new(&tls.crt_file_name);
    let key_path = Path::new(&tls.key_file_name);

    match (crt_path.exists(), key_path.exists()) {
        (true, true) => {}
        (false, false) => generate_crt_and_key_file(crt_path, key_path)?,
        _ => {
            return Err(AppError::TlsError(format!(
                "{} and {} must both exist or both be absent",
                tls.crt_file_name, tls.key_file_name
            )))
        }
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(crt_path)?))
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if certs.is_empty() {
        return Err(AppError::TlsError(format!(
            "no certificate found in {}",
            tls.crt_file_name
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            AppError::TlsError(format!("no private key found in {}", tls.key_file_name))
        })?;

    ensure_crypto_provider();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::TlsError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Writes a self-signed certificate for `localhost` and its private key.
pub fn generate_crt_and_key_file(crt_path: &Path, key_path: &Path) -> AppResult<()> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| AppError::TlsError(e.to_string()))?;

    let written = fs::write(crt_path, cert.pem())
        .and_then(|_| fs::write(key_path, key_pair.serialize_pem()));
    if let Err(e) = written {
        // never leave half a pair behind
        let _ = fs::remove_file(crt_path);
        let _ = fs::remove_file(key_path);
        return Err(e.into());
    }
    info!(
        "generated self-signed certificate {} and key {}",
        crt_path.display(),
        key_path.display()
    );
    Ok(())
}
