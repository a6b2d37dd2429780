//! Alias resolution.
//!
//! The lookup policy: certificates are searched by `CKA_LABEL` equal to
//! the alias; a single match donates its `CKA_ID` as the search id for the
//! key objects. Without a certificate the alias bytes themselves are the
//! id. More than one candidate at any step means the alias cannot be
//! resolved and reads come back empty.

use cryptoki_sys::CKA_ID;
use cryptoki_sys::CKO_CERTIFICATE;
use cryptoki_sys::CKO_PRIVATE_KEY;
use cryptoki_sys::CKO_PUBLIC_KEY;
use cryptoki_sys::CKO_SECRET_KEY;
use tracing::warn;

use crate::error::P11Error;
use crate::pkcs11::Attr;
use crate::pkcs11::ObjectHandle;
use crate::pkcs11::SessionHandle;
use crate::slot::Slot;

impl Slot {
    /// Token certificates whose label equals `label`. Multiple matches are
    /// legal but suspicious; all are returned and a warning is logged.
    pub(crate) fn certificates_by_label(
        &self,
        session: SessionHandle,
        label: &str,
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        let certificates = self.find_cached(
            session,
            CKO_CERTIFICATE,
            Attr::Label(label.as_bytes().to_vec()),
            true,
        )?;
        if certificates.len() > 1 {
            warn!(
                slot = self.id(),
                label,
                count = certificates.len(),
                "more than one certificate carries this label"
            );
        }
        Ok(certificates)
    }

    pub(crate) fn certificates_by_subject(
        &self,
        session: SessionHandle,
        subject: &[u8],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.find_cached(
            session,
            CKO_CERTIFICATE,
            Attr::Subject(subject.to_vec()),
            true,
        )
    }

    pub(crate) fn certificates_by_issuer(
        &self,
        session: SessionHandle,
        issuer: &[u8],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.find_cached(
            session,
            CKO_CERTIFICATE,
            Attr::Issuer(issuer.to_vec()),
            true,
        )
    }

    pub(crate) fn private_keys_by_id(
        &self,
        session: SessionHandle,
        id: &[u8],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.find_cached(session, CKO_PRIVATE_KEY, Attr::Id(id.to_vec()), false)
    }

    pub(crate) fn public_keys_by_id(
        &self,
        session: SessionHandle,
        id: &[u8],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.find_cached(session, CKO_PUBLIC_KEY, Attr::Id(id.to_vec()), false)
    }

    pub(crate) fn secret_keys_by_label(
        &self,
        session: SessionHandle,
        label: &str,
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.find_cached(
            session,
            CKO_SECRET_KEY,
            Attr::Label(label.as_bytes().to_vec()),
            false,
        )
    }

    /// Every private key object, bypassing the cache. Used to double-check
    /// freshly unwrapped handles.
    pub(crate) fn all_private_keys(
        &self,
        session: SessionHandle,
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.api
            .find_objects(session, &[Attr::Class(CKO_PRIVATE_KEY)])
    }

    /// The id to search key objects by, per the two-step alias policy.
    /// `None` means resolution failed softly (ambiguous label, or a
    /// certificate without an id).
    pub(crate) fn key_search_id(
        &self,
        session: SessionHandle,
        alias: &str,
    ) -> Result<Option<Vec<u8>>, P11Error> {
        let certificates = self.certificates_by_label(session, alias)?;
        match certificates.as_slice() {
            [] => Ok(Some(alias.as_bytes().to_vec())),
            [certificate] => match self.object_attribute(session, *certificate, CKA_ID)? {
                Some(id) => Ok(Some(id)),
                None => {
                    warn!(
                        slot = self.id(),
                        alias, "certificate for alias has no CKA_ID attribute"
                    );
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    pub(crate) fn private_key_for_alias(
        &self,
        session: SessionHandle,
        alias: &str,
    ) -> Result<Option<ObjectHandle>, P11Error> {
        let Some(id) = self.key_search_id(session, alias)? else {
            return Ok(None);
        };
        self.unique_key(self.private_keys_by_id(session, &id)?, alias, "private key")
    }

    pub(crate) fn public_key_for_alias(
        &self,
        session: SessionHandle,
        alias: &str,
    ) -> Result<Option<ObjectHandle>, P11Error> {
        let Some(id) = self.key_search_id(session, alias)? else {
            return Ok(None);
        };
        self.unique_key(self.public_keys_by_id(session, &id)?, alias, "public key")
    }

    fn unique_key(
        &self,
        keys: Vec<ObjectHandle>,
        alias: &str,
        kind: &'static str,
    ) -> Result<Option<ObjectHandle>, P11Error> {
        match keys.as_slice() {
            [] => Ok(None),
            [key] => Ok(Some(*key)),
            _ => {
                warn!(
                    slot = self.id(),
                    alias,
                    kind,
                    count = keys.len(),
                    "id resolves to more than one key, treating as not found"
                );
                Ok(None)
            }
        }
    }
}
