//! Certificate and certificate-chain handling.
//!
//! Chains are stored flat on the token: the leaf under the alias, CA
//! certificates under an id derived from subject, issuer and serial.
//! Removal walks issuer links upwards and keeps every certificate that
//! some other entry still chains to, accumulating those subjects so an
//! import does not resurrect deleted material.

use cryptoki_sys::CKA_ID;
use cryptoki_sys::CKA_ISSUER;
use cryptoki_sys::CKA_SUBJECT;
use cryptoki_sys::CKA_VALUE;
use cryptoki_sys::CKC_X_509;
use cryptoki_sys::CKO_CERTIFICATE;
use std::collections::HashSet;
use tracing::debug;
use tracing::warn;
use x509_parser::certificate::X509Certificate;

use crate::error::P11Error;
use crate::pkcs11::Attr;
use crate::pkcs11::ObjectHandle;
use crate::pkcs11::SessionHandle;
use crate::slot::Slot;

/// Upper bound on chain traversals; hitting it is logged and stops the
/// walk.
pub const MAX_CHAIN_LENGTH: usize = 100;

/// Parses a DER certificate, flattening the parser error into a string.
pub(crate) fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, P11Error> {
    let (_, certificate) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| P11Error::Encoding(format!("malformed X.509 certificate: {err}")))?;
    Ok(certificate)
}

/// Canonical id for a CA certificate object:
/// `subject "/" issuer "/" serial-decimal`.
pub(crate) fn certificate_id(certificate: &X509Certificate<'_>) -> String {
    format!(
        "{}/{}/{}",
        certificate.tbs_certificate.subject,
        certificate.tbs_certificate.issuer,
        certificate.tbs_certificate.serial
    )
}

impl Slot {
    /// Replaces the certificate chain of `alias`.
    ///
    /// The alias must already carry a certificate and a matching private
    /// key. The previous chain is removed first (keeping CA certificates
    /// other entries still use), then the leaf is stored under the alias
    /// and every CA certificate under its derived id, displacing any
    /// certificate that shares its subject.
    pub fn import_certificate_chain(
        &self,
        chain: &[Vec<u8>],
        alias: &str,
    ) -> Result<(), P11Error> {
        if chain.is_empty() {
            return Err(P11Error::InvalidArgument(
                "empty certificate chain".to_string(),
            ));
        }

        let guard = self.session()?;
        let session = guard.handle();

        let certificates = self.certificates_by_label(session, alias)?;
        let current = match certificates.as_slice() {
            [] => {
                return Err(P11Error::NotFound {
                    what: "certificate",
                    alias: alias.to_string(),
                })
            }
            [certificate] => *certificate,
            _ => {
                return Err(P11Error::Ambiguous {
                    what: "certificate",
                    needle: alias.to_string(),
                })
            }
        };
        let id = self
            .object_attribute(session, current, CKA_ID)?
            .ok_or_else(|| P11Error::NotFound {
                what: "certificate id",
                alias: alias.to_string(),
            })?;
        match self.private_keys_by_id(session, &id)?.as_slice() {
            [_] => {}
            [] => {
                return Err(P11Error::NotFound {
                    what: "private key",
                    alias: alias.to_string(),
                })
            }
            _ => {
                return Err(P11Error::Ambiguous {
                    what: "private key",
                    needle: alias.to_string(),
                })
            }
        }

        let mut kept_subjects = HashSet::new();
        self.remove_certificate_chain(session, current, &mut kept_subjects)?;

        let leaf = &chain[0];
        let parsed = parse_certificate(leaf)?;
        self.create_object_invalidating(
            session,
            &certificate_template(
                alias.as_bytes(),
                alias.as_bytes(),
                &parsed,
                leaf.clone(),
            ),
        )?;

        for der in &chain[1..] {
            let parsed = parse_certificate(der)?;
            let subject = parsed.tbs_certificate.subject.as_raw().to_vec();
            // a CA subject is unique on the token; displace whatever
            // currently holds it
            for existing in self.certificates_by_subject(session, &subject)? {
                debug!(
                    slot = self.id(),
                    existing, "replacing certificate with the imported subject"
                );
                self.destroy_object_invalidating(session, existing)?;
            }
            let id = certificate_id(&parsed);
            self.create_object_invalidating(
                session,
                &certificate_template(id.as_bytes(), id.as_bytes(), &parsed, der.clone()),
            )?;
        }

        self.invalidate_alias(alias);
        Ok(())
    }

    /// The DER certificate stored under `alias`, if any. With several
    /// label matches the first is returned and a warning logged.
    pub fn certificate(&self, alias: &str) -> Result<Option<Vec<u8>>, P11Error> {
        let guard = self.session()?;
        let session = guard.handle();
        let certificates = self.certificates_by_label(session, alias)?;
        let Some(&certificate) = certificates.first() else {
            return Ok(None);
        };
        let Some(der) = self.object_attribute(session, certificate, CKA_VALUE)? else {
            warn!(
                slot = self.id(),
                alias, "certificate object has no CKA_VALUE"
            );
            return Ok(None);
        };
        parse_certificate(&der)?;
        Ok(Some(der))
    }

    /// The chain for `alias`, leaf first, walking issuer links until a
    /// self-signed certificate or a missing issuer ends it.
    pub fn certificate_chain(&self, alias: &str) -> Result<Vec<Vec<u8>>, P11Error> {
        let guard = self.session()?;
        let session = guard.handle();

        let mut chain = Vec::new();
        let certificates = self.certificates_by_label(session, alias)?;
        let Some(&leaf) = certificates.first() else {
            return Ok(chain);
        };

        let mut current = leaf;
        for _ in 0..MAX_CHAIN_LENGTH {
            let Some(der) = self.object_attribute(session, current, CKA_VALUE)? else {
                warn!(
                    slot = self.id(),
                    object = current,
                    "certificate object without CKA_VALUE in chain"
                );
                break;
            };
            let (subject, issuer) = {
                let parsed = parse_certificate(&der)?;
                (
                    parsed.tbs_certificate.subject.as_raw().to_vec(),
                    parsed.tbs_certificate.issuer.as_raw().to_vec(),
                )
            };
            chain.push(der);
            if subject == issuer {
                break;
            }
            let parents = self.certificates_by_subject(session, &issuer)?;
            let Some(&parent) = parents.first() else {
                break;
            };
            if parents.len() > 1 {
                warn!(
                    slot = self.id(),
                    count = parents.len(),
                    "several certificates share the issuer subject, using the first"
                );
            }
            current = parent;
        }
        Ok(chain)
    }

    /// Removes the chain starting at `certificate`, bottom up.
    ///
    /// A certificate still referenced as issuer by another certificate is
    /// kept and its subject recorded in `kept_subjects`.
    pub(crate) fn remove_certificate_chain(
        &self,
        session: SessionHandle,
        certificate: ObjectHandle,
        kept_subjects: &mut HashSet<Vec<u8>>,
    ) -> Result<(), P11Error> {
        let mut current = certificate;
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > MAX_CHAIN_LENGTH {
                warn!(
                    slot = self.id(),
                    "certificate chain removal exceeded {MAX_CHAIN_LENGTH} steps, giving up"
                );
                break;
            }

            let Some(subject) = self.object_attribute(session, current, CKA_SUBJECT)? else {
                warn!(
                    slot = self.id(),
                    object = current,
                    "certificate object without CKA_SUBJECT, stopping chain removal"
                );
                break;
            };
            let issuer = self.object_attribute(session, current, CKA_ISSUER)?;

            let dependants = self.certificates_by_issuer(session, &subject)?;
            let in_use = dependants.iter().any(|object| *object != current);
            if in_use {
                debug!(
                    slot = self.id(),
                    object = current,
                    "certificate still issues others, keeping it"
                );
                kept_subjects.insert(subject.clone());
            } else {
                self.destroy_object_invalidating(session, current)?;
            }

            let Some(issuer) = issuer else {
                break;
            };
            if issuer == subject {
                // self-signed root
                break;
            }
            let parents = self.certificates_by_subject(session, &issuer)?;
            let Some(&parent) = parents.first() else {
                break;
            };
            if parents.len() > 1 {
                warn!(
                    slot = self.id(),
                    count = parents.len(),
                    "several certificates share the issuer subject, walking the first"
                );
            }
            current = parent;
        }
        Ok(())
    }
}

pub(crate) fn certificate_template(
    label: &[u8],
    id: &[u8],
    parsed: &X509Certificate<'_>,
    der: Vec<u8>,
) -> Vec<Attr> {
    vec![
        Attr::Class(CKO_CERTIFICATE),
        Attr::CertificateType(CKC_X_509),
        Attr::Token(true),
        Attr::Label(label.to_vec()),
        Attr::Id(id.to_vec()),
        Attr::Subject(parsed.tbs_certificate.subject.as_raw().to_vec()),
        Attr::Issuer(parsed.tbs_certificate.issuer.as_raw().to_vec()),
        Attr::SerialNumber(der_integer(parsed.tbs_certificate.raw_serial())),
        Attr::Value(der),
    ]
}

/// DER INTEGER wrapping of the raw serial content octets.
fn der_integer(content: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(content.len() + 2);
    encoded.push(0x02);
    encoded.push(content.len() as u8);
    encoded.extend_from_slice(content);
    encoded
}
