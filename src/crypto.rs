//! RSA/OAEP password authentication and TLS certificate verification.
//!
//! The wire only ever puts one key on the line: a DER `SubjectPublicKeyInfo`
//! the server sends inside its link message (see `message::PeerLinkMessage`).
//! This module turns those bytes into an `rsa::RsaPublicKey`, encrypts the
//! password under OAEP, and wipes both plaintext and ciphertext afterwards.
//!
//! `ring` only exposes RSA signature verification, not encryption, so
//! this is the one place this crate reaches for a different crate:
//! `rsa`, the RustCrypto OAEP implementation. See DESIGN.md.

use std::sync::Arc;

use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, Error as TlsError, ServerName};
use zeroize::Zeroize;

use crate::error::*;

/// OAEP overhead for SHA-1, the hash this implementation pads with:
/// `2 * hash_len + 2 = 2*20 + 2`. Matches the "`modulus_size - 41`" bound.
const OAEP_OVERHEAD: usize = 2 * 20 + 2;

/// Parses a DER-encoded `SubjectPublicKeyInfo` into an RSA public key.
///
/// `bytes` is exactly the peer-advertised key length from the link
/// message; this function does not assume any fixed size (see §6).
pub fn parse_public_key(bytes: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(bytes).wrapped(ErrorKind::Auth)
}

/// Size, in bytes, of an RSA modulus belonging to `key`.
pub fn modulus_size(key: &RsaPublicKey) -> usize {
    use rsa::traits::PublicKeyParts;
    key.size()
}

/// Encrypts `password || NUL` under RSA-OAEP with `key`, returning exactly
/// `modulus_size(key)` bytes of ciphertext. Both the assembled plaintext
/// and any scratch buffers are wiped before being dropped.
///
/// Fails with `ErrorKind::Auth` if `password` does not fit within
/// `modulus_size(key) - 41` bytes, per §4.5 — one of which is reserved for
/// the NUL terminator appended below, so the check is against `- 42`.
pub fn encrypt_password(key: &RsaPublicKey, password: &str) -> Result<Vec<u8>> {
    let max_len = modulus_size(key)
        .checked_sub(OAEP_OVERHEAD + 1)
        .ok_or_else(|| Error::simple(ErrorKind::Auth))?;
    if password.len() > max_len {
        return Err("password exceeds modulus_size - 41 bytes").wrapped(ErrorKind::Auth);
    }

    let mut plaintext = Vec::with_capacity(password.len() + 1);
    plaintext.extend_from_slice(password.as_bytes());
    plaintext.push(0);

    let padding = Oaep::new::<sha1::Sha1>();
    let result = key
        .encrypt(&mut OsRng, padding, &plaintext)
        .wrapped(ErrorKind::Auth);

    plaintext.zeroize();
    let mut ciphertext = result?;
    if ciphertext.len() != modulus_size(key) {
        ciphertext.zeroize();
        return Err("ciphertext length did not match modulus size").wrapped(ErrorKind::Auth);
    }
    Ok(ciphertext)
}

/// Standard chain + hostname verification against either the configured
/// CA bundle or the platform's trust roots — the concrete algorithm named
/// in the resolved "hostname verification" open question.
pub struct HostnameVerifier {
    inner: rustls::client::WebPkiVerifier,
}

impl HostnameVerifier {
    pub fn with_roots(roots: rustls::RootCertStore) -> Self {
        HostnameVerifier { inner: rustls::client::WebPkiVerifier::new(roots, None) }
    }

    /// Loads CA material from a PEM bundle, falling back to the platform's
    /// trust roots when `ca_pem` is `None`.
    pub fn from_ca_pem_or_platform(ca_pem: Option<&[u8]>) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        match ca_pem {
            Some(pem) => {
                let mut reader = std::io::BufReader::new(pem);
                let certs = rustls_pemfile::certs(&mut reader)
                    .wrapped(ErrorKind::Tls)?;
                for der in certs {
                    roots
                        .add(&Certificate(der))
                        .wrapped(ErrorKind::Tls)?;
                }
            }
            None => {
                roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                    rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
            }
        }
        Ok(HostnameVerifier::with_roots(roots))
    }
}

impl ServerCertVerifier for HostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        )
    }
}

/// Builds a `rustls::ClientConfig` that verifies server certificates with
/// `verifier`. Plain `rustls::ClientConfig::builder()...` wiring, kept here
/// so `channel.rs` doesn't need to know the verifier's construction.
pub fn client_config(verifier: Arc<dyn ServerCertVerifier>) -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
    )
}
