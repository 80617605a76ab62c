use std::{fs::File, io::BufReader, path::Path};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};

use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::config::{TlsClientConfig, TlsServerConfig};

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: Result<Vec<CertificateDer>, _> = parsed
        .map(|res| res.map(CertificateDer::from))
        .collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> anyhow::Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> anyhow::Result<RootCertStore> {
    let ca_certs = cert_reader(ca_path.as_ref())?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        anyhow::bail!("CA-file did not contain any valid certs")
    }
    Ok(root_store)
}

/// Builds the inbound TLS config for a Proxy Instance, or returns `None` when
/// `tls_server` is absent and accepted connections should stay plaintext.
///
/// When `client_ca` is set, client certificates are required and verified
/// against it (mutual TLS); otherwise the server authenticates itself only.
pub fn build_server_config(tls: Option<&TlsServerConfig>) -> anyhow::Result<Option<ServerConfig>> {
    let Some(tls) = tls else {
        return Ok(None);
    };

    let server_cert = cert_reader(&tls.cert)?;
    let privkey = privkey_reader(&tls.key)?;

    let config = match &tls.client_ca {
        Some(ca) => {
            let root_store = load_root_store(ca)?;
            let client_verifier = WebPkiClientVerifier::builder(root_store.into())
                .build()
                .map_err(|e| anyhow::anyhow!("building client cert verifier: {e}"))?;
            ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(server_cert, privkey)?
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(server_cert, privkey)?,
    };

    Ok(Some(config))
}

/// Builds the outbound TLS config used to dial upstreams, or returns `None`
/// when `tls_client` is absent and upstream dials should stay plaintext.
///
/// When `cert`/`key` are both set, the proxy presents a client certificate to
/// the upstream (origination mTLS). `ca` pins the trust root used to verify
/// the upstream's certificate; absent a `ca`, the platform's webpki root set
/// is used.
pub fn build_client_config(tls: Option<&TlsClientConfig>) -> anyhow::Result<Option<ClientConfig>> {
    let Some(tls) = tls else {
        return Ok(None);
    };

    let root_store = match &tls.ca {
        Some(ca) => load_root_store(ca)?,
        None => {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            root_store
        }
    };

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let client_cert = cert_reader(cert)?;
            let privkey_client = privkey_reader(key)?;
            builder.with_client_auth_cert(client_cert, privkey_client)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Some(config))
}
