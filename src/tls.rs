//! TLS server configuration: load PEM certificate chain and key (or generate a
//! self-signed pair), build the acceptor shared by the ldaps:// listener and in-band StartTLS.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    server_config(certs, key)
}

fn server_config(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

/// Subject names for a generated certificate: `ldap.<domain>` for the first naming
/// context made only of `dc=` parts, then `localhost`.
pub fn self_signed_names(naming_contexts: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    let domain = naming_contexts.iter().find_map(|nc| {
        let labels = nc
            .split(',')
            .map(|rdn| {
                let (attr, value) = rdn.trim().split_once('=')?;
                (attr.trim().eq_ignore_ascii_case("dc") && !value.trim().is_empty()).then(|| value.trim())
            })
            .collect::<Option<Vec<_>>>()?;
        (!labels.is_empty()).then(|| labels.join("."))
    });
    if let Some(domain) = domain {
        names.push(format!("ldap.{}", domain.to_ascii_lowercase()));
    }
    names.push("localhost".to_string());
    names
}

/// Freshly generated self-signed certificate and its PKCS8 key.
pub fn self_signed_material(names: Vec<String>) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let generated = rcgen::generate_simple_self_signed(names).context("Generate self-signed certificate")?;
    let cert = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.signing_key.serialize_der()));
    Ok((cert, key))
}

/// Acceptor over a freshly generated self-signed certificate.
pub fn self_signed_acceptor(names: Vec<String>) -> Result<TlsAcceptor> {
    let (cert, key) = self_signed_material(names)?;
    Ok(TlsAcceptor::from(server_config(vec![cert], key)?))
}

/// Acceptor for the configured certificate, or an error naming the missing file.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    validate_tls_files(&tls.cert_file, &tls.key_file)?;
    let config = load_server_config_from_files(&tls.cert_file, &tls.key_file)?;
    Ok(TlsAcceptor::from(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Open key file: {}", path))?;
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Check that cert and key files exist (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    Ok(())
}
