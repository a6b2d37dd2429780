//! Key lifecycle: generation, wrap/unwrap, release and removal.
//!
//! Key handles come in two session flavours. A *static* key owns the
//! session it was resolved or unwrapped on and must be given back through
//! [`Slot::release_private_key`]; a *releasable* key borrows a pooled
//! session per operation. Only static keys see PKCS#11 serial ordering
//! across consecutive calls, which unwrapped session keys rely on.

use cryptoki_sys::CKA_ALWAYS_SENSITIVE;
use cryptoki_sys::CKA_DERIVE;
use cryptoki_sys::CKA_EXTRACTABLE;
use cryptoki_sys::CKA_ID;
use cryptoki_sys::CKA_LABEL;
use cryptoki_sys::CKA_MODIFIABLE;
use cryptoki_sys::CKA_MODULUS;
use cryptoki_sys::CKA_NEVER_EXTRACTABLE;
use cryptoki_sys::CKA_PRIVATE;
use cryptoki_sys::CKA_PUBLIC_EXPONENT;
use cryptoki_sys::CKA_SENSITIVE;
use cryptoki_sys::CKK_RSA;
use cryptoki_sys::CKM_DES2_KEY_GEN;
use cryptoki_sys::CKM_DES3_KEY_GEN;
use cryptoki_sys::CKM_DES_KEY_GEN;
use cryptoki_sys::CKO_CERTIFICATE;
use cryptoki_sys::CKO_PRIVATE_KEY;
use cryptoki_sys::CKO_PUBLIC_KEY;
use cryptoki_sys::CKO_SECRET_KEY;
use cryptoki_sys::CKR_MECHANISM_INVALID;
use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_ULONG;
use rsa::BigUint;
use rsa::RsaPublicKey;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

use crate::certs::certificate_template;
use crate::certs::parse_certificate;
use crate::error::P11Error;
use crate::pkcs11::Attr;
use crate::pkcs11::Mechanism;
use crate::pkcs11::ObjectHandle;
use crate::pkcs11::SessionHandle;
use crate::slot::Slot;

/// Wait before retrying an unwrap that failed with `CKR_MECHANISM_INVALID`.
const UNWRAP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Produces the DER certificate stored alongside a generated key pair.
/// Receives the generated public key and the alias.
pub type CertificateGenerator<'a> =
    Box<dyn FnOnce(&RsaPublicKey, &str) -> anyhow::Result<Vec<u8>> + 'a>;

/// Parameters for [`Slot::generate_key_pair`].
#[derive(Debug, Clone)]
pub struct KeyPairRequest {
    /// Key pair algorithm; only `"RSA"` is supported.
    pub algorithm: String,
    pub modulus_bits: u64,
    /// Whether the public half is a token object.
    pub public_token: bool,
    /// Attributes merged over the default public template; caller wins.
    pub public_attrs: Vec<Attr>,
    /// Attributes merged over the default private template; caller wins.
    pub private_attrs: Vec<Attr>,
    /// Store the generated certificate as a token object.
    pub store_certificate: bool,
}

impl KeyPairRequest {
    pub fn rsa(modulus_bits: u64) -> Self {
        KeyPairRequest {
            algorithm: "RSA".to_string(),
            modulus_bits,
            public_token: true,
            public_attrs: Vec::new(),
            private_attrs: Vec::new(),
            store_certificate: false,
        }
    }
}

/// Result of wrap-on-generate: the wrapped private half plus the public
/// key read back from the token.
#[derive(Debug, Clone)]
pub struct GeneratedKeyData {
    pub wrapped_private_key: Vec<u8>,
    pub public_key: RsaPublicKey,
}

#[derive(Debug, Clone, Copy)]
enum KeySession {
    /// The key owns `session` until released.
    Static {
        session: SessionHandle,
        remove_on_release: bool,
    },
    /// A pooled session is acquired per operation.
    Pooled,
}

/// A private key usable for signing.
pub struct PrivateKey {
    slot: Arc<Slot>,
    alias: Option<String>,
    object: ObjectHandle,
    session: KeySession,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("alias", &self.alias)
            .field("object", &self.object)
            .finish()
    }
}

impl PrivateKey {
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn object_handle(&self) -> ObjectHandle {
        self.object
    }

    pub fn sign(&self, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, P11Error> {
        match self.session {
            KeySession::Static { session, .. } => {
                self.slot.api.sign(session, mechanism, self.object, data)
            }
            KeySession::Pooled => {
                let guard = self.slot.session()?;
                self.slot.api.sign(guard.handle(), mechanism, self.object, data)
            }
        }
    }
}

/// A secret (symmetric) key reference.
///
/// The session used to resolve it has already been returned to the pool,
/// so the handle is not guaranteed to survive an HSM restart.
#[derive(Debug, Clone)]
pub struct SecretKey {
    object: ObjectHandle,
    label: String,
}

impl SecretKey {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn object_handle(&self) -> ObjectHandle {
        self.object
    }
}

/// Kind of key behind an alias listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEntryKind {
    PrivateKey,
    SecretKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub alias: String,
    pub kind: KeyEntryKind,
}

impl Slot {
    /// Generates an RSA key pair under `alias`.
    ///
    /// Fails with [`P11Error::AlreadyExists`] when any object on the token
    /// already carries the alias as label or id. When a certificate
    /// generator is given its output is stored on the token if
    /// `request.store_certificate` is set.
    pub fn generate_key_pair(
        &self,
        alias: &str,
        request: KeyPairRequest,
        certificate_generator: Option<CertificateGenerator<'_>>,
    ) -> Result<(), P11Error> {
        if !request.algorithm.eq_ignore_ascii_case("RSA") {
            return Err(P11Error::InvalidArgument(format!(
                "unsupported key pair algorithm {:?}",
                request.algorithm
            )));
        }

        let guard = self.session()?;
        let session = guard.handle();
        self.ensure_alias_free(session, alias)?;

        let public_template = merge_template(
            default_public_template(alias, request.modulus_bits, request.public_token),
            request.public_attrs,
        );
        let private_template =
            merge_template(default_private_template(alias), request.private_attrs);

        let (public_key, _private_key) = self.api.generate_key_pair(
            session,
            Mechanism::RsaPkcsKeyPairGen,
            &public_template,
            &private_template,
        )?;
        debug!(slot = self.id(), alias, "generated RSA key pair");

        let public = self.read_public_key(session, public_key)?;

        if let Some(generate) = certificate_generator {
            let der = generate(&public, alias).map_err(P11Error::CertificateGenerator)?;
            if request.store_certificate {
                let template = {
                    let certificate = parse_certificate(&der)?;
                    certificate_template(
                        alias.as_bytes(),
                        alias.as_bytes(),
                        &certificate,
                        der.clone(),
                    )
                };
                self.create_object_invalidating(session, &template)?;
            }
        }

        self.invalidate_generated_alias(alias);
        Ok(())
    }

    /// Generates a symmetric key under `alias`.
    ///
    /// DES-family mechanisms are normalised from the bit length: 56/64 is
    /// single DES, 112/128 two-key, 168/192 three-key, and `CKA_VALUE_LEN`
    /// is omitted. Other mechanisms get `CKA_VALUE_LEN = bits / 8`.
    pub fn generate_key(
        &self,
        alias: &str,
        mechanism: Mechanism,
        bits: u64,
    ) -> Result<(), P11Error> {
        let (mechanism, value_len) = normalise_symmetric(mechanism, bits)?;

        let guard = self.session()?;
        let session = guard.handle();
        self.ensure_alias_free(session, alias)?;

        let mut template = vec![
            Attr::Token(true),
            Attr::Label(alias.as_bytes().to_vec()),
            Attr::Id(alias.as_bytes().to_vec()),
            Attr::Wrap(true),
            Attr::Unwrap(true),
            Attr::Sensitive(true),
            Attr::Extractable(false),
        ];
        if let Some(len) = value_len {
            template.push(Attr::ValueLen(len));
        }
        self.api.generate_key(session, mechanism, &template)?;
        debug!(slot = self.id(), alias, bits, "generated secret key");

        self.invalidate_generated_alias(alias);
        Ok(())
    }

    /// Generates a session-only RSA key pair and wraps the private half
    /// under the secret key labelled `wrap_key_label`.
    pub fn generate_wrapped_key(
        &self,
        wrap_key_label: &str,
        algorithm: &str,
        modulus_bits: u64,
        wrap_mechanism: Mechanism,
    ) -> Result<GeneratedKeyData, P11Error> {
        if !algorithm.eq_ignore_ascii_case("RSA") {
            return Err(P11Error::InvalidArgument(format!(
                "unsupported key pair algorithm {algorithm:?}"
            )));
        }

        let guard = self.session()?;
        let session = guard.handle();
        let wrap_keys = self.secret_keys_by_label(session, wrap_key_label)?;
        if wrap_keys.len() > 1 {
            return Err(P11Error::Ambiguous {
                what: "wrapping key",
                needle: wrap_key_label.to_string(),
            });
        }
        let Some(&wrapping_key) = wrap_keys.first() else {
            warn!(
                slot = self.id(),
                wrap_key_label, "no wrapping key with this label"
            );
            return Err(P11Error::NotFound {
                what: "wrapping key",
                alias: wrap_key_label.to_string(),
            });
        };

        let public_template = [
            Attr::Token(false),
            Attr::Encrypt(false),
            Attr::Verify(true),
            Attr::Wrap(false),
            Attr::ModulusBits(modulus_bits as CK_ULONG),
            Attr::PublicExponent(vec![0x01, 0x00, 0x01]),
        ];
        // the private half never becomes a token object and must stay
        // extractable for the wrap
        let private_template = [
            Attr::Token(false),
            Attr::Private(true),
            Attr::Sensitive(true),
            Attr::Decrypt(false),
            Attr::Sign(true),
            Attr::Extractable(true),
        ];
        let (public_key, private_key) = self.api.generate_key_pair(
            session,
            Mechanism::RsaPkcsKeyPairGen,
            &public_template,
            &private_template,
        )?;

        let wrapped_private_key =
            self.api
                .wrap_key(session, wrap_mechanism, wrapping_key, private_key)?;
        let public = self.read_public_key(session, public_key)?;

        Ok(GeneratedKeyData {
            wrapped_private_key,
            public_key: public,
        })
    }

    /// Unwraps an RSA private key under the secret key labelled
    /// `wrap_key_label` and binds it to a dedicated session.
    ///
    /// The returned key is session-only material: releasing it destroys
    /// the object. `CKR_MECHANISM_INVALID` is retried once after a short
    /// delay, and a handle missing from a follow-up enumeration triggers
    /// one more unwrap.
    pub fn unwrap_private_key(
        self: &Arc<Self>,
        wrapped: &[u8],
        wrap_key_label: &str,
        mechanism: Mechanism,
    ) -> Result<PrivateKey, P11Error> {
        let guard = self.session()?;
        let session = guard.handle();

        let wrap_keys = self.secret_keys_by_label(session, wrap_key_label)?;
        let wrapping_key = match wrap_keys.as_slice() {
            [] => {
                return Err(P11Error::NotFound {
                    what: "wrapping key",
                    alias: wrap_key_label.to_string(),
                })
            }
            [key] => *key,
            _ => {
                return Err(P11Error::Ambiguous {
                    what: "wrapping key",
                    needle: wrap_key_label.to_string(),
                })
            }
        };

        let template = [
            Attr::Class(CKO_PRIVATE_KEY),
            Attr::KeyType(CKK_RSA),
            Attr::Private(true),
            Attr::Decrypt(true),
            Attr::Sign(true),
            Attr::Sensitive(true),
            Attr::Extractable(true),
        ];
        let unwrap = || {
            self.api
                .unwrap_key(session, mechanism, wrapping_key, wrapped, &template)
        };

        let mut object = match unwrap() {
            Err(err) if err.is_rv(CKR_MECHANISM_INVALID) => {
                warn!(
                    slot = self.id(),
                    "unwrap failed with CKR_MECHANISM_INVALID, retrying once"
                );
                thread::sleep(UNWRAP_RETRY_DELAY);
                unwrap()?
            }
            result => result?,
        };

        // some tokens hand back a handle that later fails sign-init; an
        // absent handle in a full enumeration betrays that early
        if !self.all_private_keys(session)?.contains(&object) {
            warn!(
                slot = self.id(),
                object, "unwrapped key not present in enumeration, unwrapping again"
            );
            object = unwrap()?;
        }

        let session = guard.detach();
        Ok(PrivateKey {
            slot: Arc::clone(self),
            alias: None,
            object,
            session: KeySession::Static {
                session,
                remove_on_release: true,
            },
        })
    }

    /// Resolves `alias` to a private key bound to a dedicated session.
    pub fn acquire_private_key(
        self: &Arc<Self>,
        alias: &str,
    ) -> Result<Option<PrivateKey>, P11Error> {
        let guard = self.session()?;
        let Some(object) = self.private_key_for_alias(guard.handle(), alias)? else {
            return Ok(None);
        };
        let session = guard.detach();
        Ok(Some(PrivateKey {
            slot: Arc::clone(self),
            alias: Some(alias.to_string()),
            object,
            session: KeySession::Static {
                session,
                remove_on_release: false,
            },
        }))
    }

    /// Resolves `alias` to a private key that borrows a pooled session per
    /// operation.
    pub fn releasable_private_key(
        self: &Arc<Self>,
        alias: &str,
    ) -> Result<Option<PrivateKey>, P11Error> {
        let guard = self.session()?;
        let Some(object) = self.private_key_for_alias(guard.handle(), alias)? else {
            return Ok(None);
        };
        Ok(Some(PrivateKey {
            slot: Arc::clone(self),
            alias: Some(alias.to_string()),
            object,
            session: KeySession::Pooled,
        }))
    }

    /// Gives a private key back. Session-only material is destroyed;
    /// cleanup failures are logged, the session release always runs.
    pub fn release_private_key(&self, key: PrivateKey) {
        match key.session {
            KeySession::Static {
                session,
                remove_on_release,
            } => {
                if remove_on_release {
                    if let Err(err) = key.slot.destroy_object_invalidating(session, key.object) {
                        warn!(object = key.object, error = %err, "failed to destroy session key");
                    }
                }
                key.slot.release_session(session);
            }
            KeySession::Pooled => {}
        }
    }

    /// The RSA public key for `alias`, if resolvable.
    pub fn public_key(&self, alias: &str) -> Result<Option<RsaPublicKey>, P11Error> {
        let guard = self.session()?;
        let Some(object) = self.public_key_for_alias(guard.handle(), alias)? else {
            return Ok(None);
        };
        Ok(Some(self.read_public_key(guard.handle(), object)?))
    }

    /// The secret key labelled `alias`, if unique.
    pub fn secret_key(&self, alias: &str) -> Result<Option<SecretKey>, P11Error> {
        let guard = self.session()?;
        let keys = self.secret_keys_by_label(guard.handle(), alias)?;
        match keys.as_slice() {
            [] => Ok(None),
            [key] => Ok(Some(SecretKey {
                object: *key,
                label: alias.to_string(),
            })),
            _ => {
                warn!(
                    slot = self.id(),
                    alias,
                    count = keys.len(),
                    "more than one secret key carries this label"
                );
                Ok(None)
            }
        }
    }

    /// Removes the key material behind `alias`, including its certificate
    /// chain. Returns whether the target key is gone afterwards.
    pub fn remove_key(&self, alias: &str) -> Result<bool, P11Error> {
        let guard = self.session()?;
        let session = guard.handle();

        let certificates = self.certificates_by_label(session, alias)?;
        let removed = if certificates.is_empty() {
            self.remove_key_objects_by_alias(session, alias)?
        } else {
            let mut ids = Vec::new();
            for certificate in certificates {
                let Some(id) = self.object_attribute(session, certificate, CKA_ID)? else {
                    warn!(
                        slot = self.id(),
                        alias, "certificate has no CKA_ID, nothing to remove for it"
                    );
                    continue;
                };
                let keys = self.private_keys_by_id(session, &id)?;
                if keys.len() == 1 {
                    self.destroy_object_invalidating(session, keys[0])?;
                } else {
                    warn!(
                        slot = self.id(),
                        alias,
                        count = keys.len(),
                        "expected exactly one private key for the certificate id"
                    );
                }
                let mut kept_subjects = HashSet::new();
                self.remove_certificate_chain(session, certificate, &mut kept_subjects)?;
                ids.push(id);
            }
            let mut all_gone = true;
            for id in &ids {
                all_gone &= self.private_keys_by_id(session, id)?.is_empty();
            }
            all_gone
        };

        self.invalidate_alias(alias);
        Ok(removed)
    }

    /// Appends a textual dump of the protection attributes of the private
    /// key behind `alias`.
    pub fn security_info(&self, alias: &str, out: &mut String) -> Result<(), P11Error> {
        const ATTRIBUTES: [(&str, CK_ATTRIBUTE_TYPE); 7] = [
            ("CKA_SENSITIVE", CKA_SENSITIVE),
            ("CKA_ALWAYS_SENSITIVE", CKA_ALWAYS_SENSITIVE),
            ("CKA_EXTRACTABLE", CKA_EXTRACTABLE),
            ("CKA_NEVER_EXTRACTABLE", CKA_NEVER_EXTRACTABLE),
            ("CKA_PRIVATE", CKA_PRIVATE),
            ("CKA_DERIVE", CKA_DERIVE),
            ("CKA_MODIFIABLE", CKA_MODIFIABLE),
        ];

        let guard = self.session()?;
        let key = self
            .private_key_for_alias(guard.handle(), alias)?
            .ok_or_else(|| P11Error::NotFound {
                what: "private key",
                alias: alias.to_string(),
            })?;
        let values = self
            .api
            .attributes(guard.handle(), key, &ATTRIBUTES.map(|(_, attribute)| attribute))?;
        for ((name, _), value) in ATTRIBUTES.iter().zip(values) {
            let rendered = match value.as_deref() {
                Some([0]) => "FALSE",
                Some([_]) => "TRUE",
                Some(_) => "malformed",
                None => "unknown",
            };
            let _ = writeln!(out, "  {name}={rendered}");
        }
        Ok(())
    }

    /// Lazily enumerates the key aliases on the token.
    ///
    /// A private key is listed under the label of its matching
    /// certificate when there is one, otherwise under the UTF-8 decoding
    /// of its id; undecodable entries are skipped with a warning.
    pub fn aliases(self: &Arc<Self>) -> Result<Aliases, P11Error> {
        let session = self.acquire_session()?;
        let collected: Result<VecDeque<(ObjectHandle, KeyEntryKind)>, P11Error> = (|| {
            let mut queue = VecDeque::new();
            let private = self
                .api
                .find_objects(session, &[Attr::Class(CKO_PRIVATE_KEY), Attr::Token(true)])?;
            queue.extend(private.into_iter().map(|o| (o, KeyEntryKind::PrivateKey)));
            let secret = self
                .api
                .find_objects(session, &[Attr::Class(CKO_SECRET_KEY), Attr::Token(true)])?;
            queue.extend(secret.into_iter().map(|o| (o, KeyEntryKind::SecretKey)));
            Ok(queue)
        })();
        match collected {
            Ok(queue) => Ok(Aliases {
                slot: Arc::clone(self),
                session,
                queue,
            }),
            Err(err) => {
                self.release_session(session);
                Err(err)
            }
        }
    }

    pub(crate) fn read_public_key(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<RsaPublicKey, P11Error> {
        let modulus = self
            .object_attribute(session, object, CKA_MODULUS)?
            .ok_or_else(|| P11Error::Encoding("public key object has no modulus".to_string()))?;
        let exponent = match self.object_attribute(session, object, CKA_PUBLIC_EXPONENT)? {
            Some(exponent) if !exponent.is_empty() => exponent,
            _ => {
                debug!(object, "no public exponent on the token, assuming 65537");
                vec![0x01, 0x00, 0x01]
            }
        };
        RsaPublicKey::new(
            BigUint::from_bytes_be(&modulus),
            BigUint::from_bytes_be(&exponent),
        )
        .map_err(|err| P11Error::Encoding(format!("invalid RSA public key on token: {err}")))
    }

    fn ensure_alias_free(&self, session: SessionHandle, alias: &str) -> Result<(), P11Error> {
        let by_label = self
            .api
            .find_objects(session, &[Attr::Label(alias.as_bytes().to_vec())])?;
        let by_id = self
            .api
            .find_objects(session, &[Attr::Id(alias.as_bytes().to_vec())])?;
        if by_label.is_empty() && by_id.is_empty() {
            Ok(())
        } else {
            Err(P11Error::AlreadyExists {
                alias: alias.to_string(),
            })
        }
    }

    fn remove_key_objects_by_alias(
        &self,
        session: SessionHandle,
        alias: &str,
    ) -> Result<bool, P11Error> {
        let alias_bytes = alias.as_bytes().to_vec();
        for class in [CKO_SECRET_KEY, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY] {
            for search in [
                Attr::Label(alias_bytes.clone()),
                Attr::Id(alias_bytes.clone()),
            ] {
                let objects = self
                    .api
                    .find_objects(session, &[Attr::Class(class), search])?;
                for object in objects {
                    self.destroy_object_invalidating(session, object)?;
                }
            }
        }
        let remaining = self
            .api
            .find_objects(session, &[Attr::Label(alias_bytes)])?;
        Ok(remaining.is_empty())
    }

    /// Purges cached searches after generation created objects under the
    /// alias, its id and the derived pub-/priv- labels.
    fn invalidate_generated_alias(&self, alias: &str) {
        let mut state = self.lock();
        state.cache.remove_by_label(alias.as_bytes());
        state
            .cache
            .remove_by_label(format!("pub-{alias}").as_bytes());
        state
            .cache
            .remove_by_label(format!("priv-{alias}").as_bytes());
    }
}

/// Lazy alias listing; holds a pooled session until dropped.
pub struct Aliases {
    slot: Arc<Slot>,
    session: SessionHandle,
    queue: VecDeque<(ObjectHandle, KeyEntryKind)>,
}

impl Aliases {
    fn resolve(
        &self,
        object: ObjectHandle,
        kind: KeyEntryKind,
    ) -> Result<Option<AliasEntry>, P11Error> {
        let raw = match kind {
            KeyEntryKind::SecretKey => self.slot.object_attribute(self.session, object, CKA_LABEL)?,
            KeyEntryKind::PrivateKey => {
                let Some(id) = self.slot.object_attribute(self.session, object, CKA_ID)? else {
                    warn!(object, "private key without CKA_ID, skipping");
                    return Ok(None);
                };
                let certificates = self.slot.find_cached(
                    self.session,
                    CKO_CERTIFICATE,
                    Attr::Id(id.clone()),
                    true,
                )?;
                match certificates.first() {
                    Some(&certificate) => self
                        .slot
                        .object_attribute(self.session, certificate, CKA_LABEL)?
                        .or(Some(id)),
                    None => Some(id),
                }
            }
        };
        let Some(raw) = raw else {
            warn!(object, "key object without a usable alias, skipping");
            return Ok(None);
        };
        match String::from_utf8(raw) {
            Ok(alias) => Ok(Some(AliasEntry { alias, kind })),
            Err(_) => {
                warn!(object, "alias bytes are not valid UTF-8, skipping");
                Ok(None)
            }
        }
    }
}

impl Iterator for Aliases {
    type Item = Result<AliasEntry, P11Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (object, kind) = self.queue.pop_front()?;
            match self.resolve(object, kind) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl Drop for Aliases {
    fn drop(&mut self) {
        self.slot.release_session(self.session);
    }
}

fn normalise_symmetric(
    mechanism: Mechanism,
    bits: u64,
) -> Result<(Mechanism, Option<CK_ULONG>), P11Error> {
    match mechanism.mechanism_type() {
        CKM_DES_KEY_GEN | CKM_DES2_KEY_GEN | CKM_DES3_KEY_GEN => match bits {
            56 | 64 => Ok((Mechanism::DesKeyGen, None)),
            112 | 128 => Ok((Mechanism::Des2KeyGen, None)),
            168 | 192 => Ok((Mechanism::Des3KeyGen, None)),
            _ => Err(P11Error::InvalidArgument(format!(
                "invalid DES key length {bits}"
            ))),
        },
        _ => {
            if bits == 0 || bits % 8 != 0 {
                return Err(P11Error::InvalidArgument(format!(
                    "invalid key length {bits}"
                )));
            }
            Ok((mechanism, Some((bits / 8) as CK_ULONG)))
        }
    }
}

fn default_public_template(alias: &str, modulus_bits: u64, token: bool) -> Vec<Attr> {
    vec![
        Attr::Token(token),
        Attr::Encrypt(false),
        Attr::Verify(true),
        Attr::Wrap(false),
        Attr::ModulusBits(modulus_bits as CK_ULONG),
        Attr::PublicExponent(vec![0x01, 0x00, 0x01]),
        Attr::Label(format!("pub-{alias}").into_bytes()),
        Attr::Id(alias.as_bytes().to_vec()),
    ]
}

fn default_private_template(alias: &str) -> Vec<Attr> {
    vec![
        Attr::Token(true),
        Attr::Private(true),
        Attr::Sensitive(true),
        Attr::Decrypt(false),
        Attr::Sign(true),
        Attr::Unwrap(false),
        Attr::Extractable(false),
        Attr::Label(format!("priv-{alias}").into_bytes()),
        Attr::Id(alias.as_bytes().to_vec()),
    ]
}

/// Caller attributes replace defaults of the same type; new ones append.
fn merge_template(defaults: Vec<Attr>, overrides: Vec<Attr>) -> Vec<Attr> {
    let mut merged = defaults;
    for attr in overrides {
        match merged
            .iter_mut()
            .find(|existing| existing.attribute_type() == attr.attribute_type())
        {
            Some(existing) => *existing = attr,
            None => merged.push(attr),
        }
    }
    merged
}
