//! In-memory Cryptoki implementation for tests.
//!
//! Objects are attribute maps, matched against templates by byte
//! equality, so the device layer above sees the same semantics a token
//! gives it: handle-based lookups, template searches, absent attributes.
//! Failure modes that matter to the retry logic are programmable.

use cryptoki_sys::CKA_CLASS;
use cryptoki_sys::CKA_KEY_TYPE;
use cryptoki_sys::CKA_MODULUS;
use cryptoki_sys::CKA_PUBLIC_EXPONENT;
use cryptoki_sys::CKK_AES;
use cryptoki_sys::CKK_DES;
use cryptoki_sys::CKK_DES2;
use cryptoki_sys::CKK_DES3;
use cryptoki_sys::CKK_RSA;
use cryptoki_sys::CKM_AES_KEY_GEN;
use cryptoki_sys::CKM_DES2_KEY_GEN;
use cryptoki_sys::CKM_DES3_KEY_GEN;
use cryptoki_sys::CKM_DES_KEY_GEN;
use cryptoki_sys::CKO_PRIVATE_KEY;
use cryptoki_sys::CKO_PUBLIC_KEY;
use cryptoki_sys::CKO_SECRET_KEY;
use cryptoki_sys::CKR_DEVICE_ERROR;
use cryptoki_sys::CKR_OBJECT_HANDLE_INVALID;
use cryptoki_sys::CKR_OK;
use cryptoki_sys::CKR_OPERATION_NOT_INITIALIZED;
use cryptoki_sys::CKR_SESSION_HANDLE_INVALID;
use cryptoki_sys::CKR_SIGNATURE_INVALID;
use cryptoki_sys::CKR_USER_ALREADY_LOGGED_IN;
use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_KEY_TYPE;
use cryptoki_sys::CK_RV;
use once_cell::sync::Lazy;
use rsa::pss::Pss;
use rsa::BigUint;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::authorize::KAK_PSS_SALT_LEN;
use crate::error::P11Error;
use crate::pkcs11::Attr;
use crate::pkcs11::Cp5Params;
use crate::pkcs11::Cryptoki;
use crate::pkcs11::Mechanism;
use crate::pkcs11::ObjectHandle;
use crate::pkcs11::SessionHandle;
use crate::pkcs11::SlotId;
use crate::pkcs11::TokenInfo;
use crate::pkcs11::KEY_AUTHORIZATION_HASH_LEN;

type FakeObject = BTreeMap<CK_ATTRIBUTE_TYPE, Vec<u8>>;

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectHandle, FakeObject>,
    next_object: ObjectHandle,
    sessions: BTreeSet<SessionHandle>,
    next_session: SessionHandle,
    logged_in: bool,
    pin: Option<Vec<u8>>,
    calls: BTreeMap<&'static str, usize>,
    fail_open_session: bool,
    unwrap_results: VecDeque<CK_RV>,
    vanish_next_unwrap: bool,
    kak: Option<(Vec<u8>, Vec<u8>)>,
    pending_authorization: Option<([u8; KEY_AUTHORIZATION_HASH_LEN], Option<u64>)>,
    authorized: Vec<Option<u64>>,
}

/// An in-memory token behind the [`Cryptoki`] trait.
pub(crate) struct FakeToken {
    slots: Vec<(SlotId, Vec<u8>)>,
    state: Mutex<FakeState>,
}

impl FakeToken {
    pub fn new() -> Arc<Self> {
        Self::with_slots(vec![(1, b"TEST TOKEN".to_vec())])
    }

    pub fn with_slots(slots: Vec<(SlotId, Vec<u8>)>) -> Arc<Self> {
        Arc::new(FakeToken {
            slots,
            state: Mutex::new(FakeState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, call: &'static str) {
        *self.lock().calls.entry(call).or_insert(0) += 1;
    }

    pub fn calls(&self, call: &'static str) -> usize {
        self.lock().calls.get(call).copied().unwrap_or(0)
    }

    pub fn insert_object(&self, attrs: Vec<Attr>) -> ObjectHandle {
        let mut state = self.lock();
        state.next_object += 1;
        let handle = state.next_object;
        state.objects.insert(handle, template_to_object(&attrs));
        handle
    }

    pub fn attrs(&self, object: ObjectHandle) -> Option<FakeObject> {
        self.lock().objects.get(&object).cloned()
    }

    pub fn object_exists(&self, object: ObjectHandle) -> bool {
        self.lock().objects.contains_key(&object)
    }

    pub fn fail_open_session(&self) {
        self.lock().fail_open_session = true;
    }

    pub fn queue_unwrap_results(&self, results: &[CK_RV]) {
        self.lock().unwrap_results.extend(results);
    }

    pub fn vanish_next_unwrap(&self) {
        self.lock().vanish_next_unwrap = true;
    }

    pub fn logged_in(&self) -> bool {
        self.lock().logged_in
    }

    pub fn pin(&self) -> Option<Vec<u8>> {
        self.lock().pin.clone()
    }

    /// Completed authorizations: `None` for an initialize, the operation
    /// count for an authorize.
    pub fn authorized(&self) -> Vec<Option<u64>> {
        self.lock().authorized.clone()
    }
}

fn template_to_object(attrs: &[Attr]) -> FakeObject {
    attrs
        .iter()
        .map(|attr| (attr.attribute_type(), attr.value_bytes()))
        .collect()
}

fn err(call: &'static str, rv: CK_RV) -> P11Error {
    P11Error::Cryptoki { call, rv }
}

fn ensure_session(state: &FakeState, call: &'static str, session: SessionHandle) -> Result<(), P11Error> {
    if state.sessions.contains(&session) {
        Ok(())
    } else {
        Err(err(call, CKR_SESSION_HANDLE_INVALID))
    }
}

/// Deterministic, structurally valid RSA modulus bytes for a generated
/// key: high bit set, odd, unique per handle.
fn fake_modulus(bits: u64, handle: ObjectHandle) -> Vec<u8> {
    let len = (bits / 8).max(2) as usize;
    let mut modulus = vec![0xab; len];
    modulus[0] = 0x80 | (handle as u8 & 0x3f);
    modulus[1] = handle as u8;
    modulus[len - 1] |= 1;
    modulus
}

fn symmetric_key_type(mechanism: Mechanism) -> CK_KEY_TYPE {
    match mechanism.mechanism_type() {
        CKM_DES_KEY_GEN => CKK_DES,
        CKM_DES2_KEY_GEN => CKK_DES2,
        CKM_DES3_KEY_GEN => CKK_DES3,
        CKM_AES_KEY_GEN => CKK_AES,
        _ => CKK_AES,
    }
}

impl Cryptoki for FakeToken {
    fn initialize(&self) -> Result<(), P11Error> {
        self.count("C_Initialize");
        Ok(())
    }

    fn slot_ids(&self, _with_tokens: bool) -> Result<Vec<SlotId>, P11Error> {
        Ok(self.slots.iter().map(|(id, _)| *id).collect())
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, P11Error> {
        let (_, label_bytes) = self
            .slots
            .iter()
            .find(|(id, _)| *id == slot)
            .ok_or(err("C_GetTokenInfo", CKR_DEVICE_ERROR))?;
        let mut label = [b' '; 32];
        let len = label_bytes.len().min(32);
        label[..len].copy_from_slice(&label_bytes[..len]);
        Ok(TokenInfo { label })
    }

    fn open_session(&self, _slot: SlotId) -> Result<SessionHandle, P11Error> {
        self.count("C_OpenSession");
        let mut state = self.lock();
        if state.fail_open_session {
            return Err(err("C_OpenSession", CKR_DEVICE_ERROR));
        }
        state.next_session += 1;
        let session = state.next_session;
        state.sessions.insert(session);
        Ok(session)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), P11Error> {
        self.count("C_CloseSession");
        if self.lock().sessions.remove(&session) {
            Ok(())
        } else {
            Err(err("C_CloseSession", CKR_SESSION_HANDLE_INVALID))
        }
    }

    fn login(&self, session: SessionHandle, pin: &[u8]) -> Result<(), P11Error> {
        self.count("C_Login");
        let mut state = self.lock();
        ensure_session(&state, "C_Login", session)?;
        if state.logged_in {
            return Err(err("C_Login", CKR_USER_ALREADY_LOGGED_IN));
        }
        state.logged_in = true;
        state.pin = Some(pin.to_vec());
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> Result<(), P11Error> {
        self.count("C_Logout");
        let mut state = self.lock();
        ensure_session(&state, "C_Logout", session)?;
        state.logged_in = false;
        Ok(())
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        self.count("C_FindObjectsInit");
        let state = self.lock();
        ensure_session(&state, "C_FindObjectsInit", session)?;
        let wanted = template_to_object(template);
        Ok(state
            .objects
            .iter()
            .filter(|(_, attrs)| {
                wanted
                    .iter()
                    .all(|(key, value)| attrs.get(key) == Some(value))
            })
            .map(|(handle, _)| *handle)
            .collect())
    }

    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Option<Vec<u8>>, P11Error> {
        self.count("C_GetAttributeValue");
        let state = self.lock();
        ensure_session(&state, "C_GetAttributeValue", session)?;
        let attrs = state
            .objects
            .get(&object)
            .ok_or(err("C_GetAttributeValue", CKR_OBJECT_HANDLE_INVALID))?;
        Ok(attrs.get(&attribute).cloned())
    }

    fn create_object(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        self.count("C_CreateObject");
        {
            let state = self.lock();
            ensure_session(&state, "C_CreateObject", session)?;
        }
        Ok(self.insert_object(template.to_vec()))
    }

    fn destroy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<(), P11Error> {
        self.count("C_DestroyObject");
        let mut state = self.lock();
        ensure_session(&state, "C_DestroyObject", session)?;
        state
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or(err("C_DestroyObject", CKR_OBJECT_HANDLE_INVALID))
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        self.count("C_GenerateKey");
        let mut state = self.lock();
        ensure_session(&state, "C_GenerateKey", session)?;
        let mut object = template_to_object(template);
        object.insert(CKA_CLASS, CKO_SECRET_KEY.to_ne_bytes().to_vec());
        object.insert(
            CKA_KEY_TYPE,
            symmetric_key_type(mechanism).to_ne_bytes().to_vec(),
        );
        state.next_object += 1;
        let handle = state.next_object;
        state.objects.insert(handle, object);
        Ok(handle)
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        _mechanism: Mechanism,
        public_template: &[Attr],
        private_template: &[Attr],
    ) -> Result<(ObjectHandle, ObjectHandle), P11Error> {
        self.count("C_GenerateKeyPair");
        let mut state = self.lock();
        ensure_session(&state, "C_GenerateKeyPair", session)?;

        let bits = public_template
            .iter()
            .find_map(|attr| match attr {
                Attr::ModulusBits(bits) => Some(*bits as u64),
                _ => None,
            })
            .unwrap_or(2048);

        state.next_object += 1;
        let public_handle = state.next_object;
        let modulus = fake_modulus(bits, public_handle);

        let mut public = template_to_object(public_template);
        public.insert(CKA_CLASS, CKO_PUBLIC_KEY.to_ne_bytes().to_vec());
        public.insert(CKA_KEY_TYPE, CKK_RSA.to_ne_bytes().to_vec());
        public.insert(CKA_MODULUS, modulus.clone());
        public.insert(CKA_PUBLIC_EXPONENT, vec![0x01, 0x00, 0x01]);
        state.objects.insert(public_handle, public);

        state.next_object += 1;
        let private_handle = state.next_object;
        let mut private = template_to_object(private_template);
        private.insert(CKA_CLASS, CKO_PRIVATE_KEY.to_ne_bytes().to_vec());
        private.insert(CKA_KEY_TYPE, CKK_RSA.to_ne_bytes().to_vec());
        private.insert(CKA_MODULUS, modulus);
        state.objects.insert(private_handle, private);

        Ok((public_handle, private_handle))
    }

    fn wrap_key(
        &self,
        session: SessionHandle,
        _mechanism: Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>, P11Error> {
        self.count("C_WrapKey");
        let state = self.lock();
        ensure_session(&state, "C_WrapKey", session)?;
        if !state.objects.contains_key(&wrapping_key) {
            return Err(err("C_WrapKey", CKR_OBJECT_HANDLE_INVALID));
        }
        let wrapped = state
            .objects
            .get(&key)
            .and_then(|attrs| attrs.get(&CKA_MODULUS))
            .ok_or(err("C_WrapKey", CKR_OBJECT_HANDLE_INVALID))?;
        Ok(wrapped.clone())
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        _mechanism: Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        self.count("C_UnwrapKey");
        let mut state = self.lock();
        ensure_session(&state, "C_UnwrapKey", session)?;
        if !state.objects.contains_key(&unwrapping_key) {
            return Err(err("C_UnwrapKey", CKR_OBJECT_HANDLE_INVALID));
        }
        if let Some(rv) = state.unwrap_results.pop_front() {
            if rv != CKR_OK {
                return Err(err("C_UnwrapKey", rv));
            }
        }

        state.next_object += 1;
        let handle = state.next_object;
        if state.vanish_next_unwrap {
            // hand out a handle that no enumeration will ever show
            state.vanish_next_unwrap = false;
            return Ok(handle);
        }
        let mut object = template_to_object(template);
        object.insert(CKA_MODULUS, wrapped.to_vec());
        state.objects.insert(handle, object);
        Ok(handle)
    }

    fn sign(
        &self,
        session: SessionHandle,
        _mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, P11Error> {
        self.count("C_Sign");
        let state = self.lock();
        ensure_session(&state, "C_SignInit", session)?;
        if !state.objects.contains_key(&key) {
            return Err(err("C_SignInit", CKR_OBJECT_HANDLE_INVALID));
        }
        let mut signature = key.to_ne_bytes().to_vec();
        signature.extend_from_slice(data);
        Ok(signature)
    }

    fn authorize_key_init(
        &self,
        session: SessionHandle,
        params: &Cp5Params<'_>,
        key: ObjectHandle,
    ) -> Result<[u8; KEY_AUTHORIZATION_HASH_LEN], P11Error> {
        self.count("C_AuthorizeKeyInit");
        let mut state = self.lock();
        ensure_session(&state, "C_AuthorizeKeyInit", session)?;
        if !state.objects.contains_key(&key) {
            return Err(err("C_AuthorizeKeyInit", CKR_OBJECT_HANDLE_INVALID));
        }

        let operations = match params {
            Cp5Params::Initialize {
                modulus,
                public_exponent,
                ..
            } => {
                state.kak = Some((modulus.to_vec(), public_exponent.to_vec()));
                None
            }
            Cp5Params::Authorize { operations } => Some(*operations),
        };

        let mut hash = [0u8; KEY_AUTHORIZATION_HASH_LEN];
        for (index, byte) in hash.iter_mut().enumerate() {
            *byte = (index as u8).wrapping_mul(31) ^ (key as u8);
        }
        state.pending_authorization = Some((hash, operations));
        Ok(hash)
    }

    fn authorize_key(&self, session: SessionHandle, signature: &[u8]) -> Result<(), P11Error> {
        self.count("C_AuthorizeKey");
        let mut state = self.lock();
        ensure_session(&state, "C_AuthorizeKey", session)?;
        let (hash, operations) = state
            .pending_authorization
            .take()
            .ok_or(err("C_AuthorizeKey", CKR_OPERATION_NOT_INITIALIZED))?;
        let (modulus, exponent) = state
            .kak
            .clone()
            .ok_or(err("C_AuthorizeKey", CKR_OPERATION_NOT_INITIALIZED))?;

        let kak = RsaPublicKey::new(
            BigUint::from_bytes_be(&modulus),
            BigUint::from_bytes_be(&exponent),
        )
        .map_err(|_| err("C_AuthorizeKey", CKR_SIGNATURE_INVALID))?;
        kak.verify(
            Pss::new_with_salt::<Sha256>(KAK_PSS_SALT_LEN),
            &hash,
            signature,
        )
        .map_err(|_| err("C_AuthorizeKey", CKR_SIGNATURE_INVALID))?;

        state.authorized.push(operations);
        Ok(())
    }
}

static TEST_KAK: Lazy<RsaPrivateKey> =
    Lazy::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("KAK generation"));

/// A cached software KAK; 1024 bits keeps the tests quick while leaving
/// room for the 32-byte PSS salt.
pub(crate) fn test_kak() -> RsaPrivateKey {
    TEST_KAK.clone()
}

/// DER of a fresh self-signed certificate with the given common name.
pub(crate) fn self_signed_der(common_name: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("key pair");
    let params = ca_params(common_name);
    params.self_signed(&key).expect("self-signed").der().to_vec()
}

/// A chain of DER certificates, leaf first, root last; each certificate
/// is issued by the next one.
pub(crate) fn test_chain(common_names: &[&str]) -> Vec<Vec<u8>> {
    let keys: Vec<rcgen::KeyPair> = common_names
        .iter()
        .map(|_| rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("key pair"))
        .collect();
    let params: Vec<rcgen::CertificateParams> =
        common_names.iter().map(|cn| ca_params(cn)).collect();

    let last = common_names.len() - 1;
    let mut ders = vec![Vec::new(); common_names.len()];
    ders[last] = params[last]
        .self_signed(&keys[last])
        .expect("root")
        .der()
        .to_vec();
    for index in (0..last).rev() {
        let issuer = rcgen::Issuer::from_params(&params[index + 1], &keys[index + 1]);
        ders[index] = params[index]
            .signed_by(&keys[index], &issuer)
            .expect("issued certificate")
            .der()
            .to_vec();
    }
    ders
}

fn ca_params(common_name: &str) -> rcgen::CertificateParams {
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, common_name);
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = distinguished_name;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
}

/// The token-object template for a stored certificate, as the chain
/// import would create it.
pub(crate) fn certificate_attrs(der: &[u8], label: &[u8], id: &[u8]) -> Vec<Attr> {
    let (_, parsed) = x509_parser::parse_x509_certificate(der).expect("test certificate");
    vec![
        Attr::Class(cryptoki_sys::CKO_CERTIFICATE),
        Attr::CertificateType(cryptoki_sys::CKC_X_509),
        Attr::Token(true),
        Attr::Label(label.to_vec()),
        Attr::Id(id.to_vec()),
        Attr::Subject(parsed.tbs_certificate.subject.as_raw().to_vec()),
        Attr::Issuer(parsed.tbs_certificate.issuer.as_raw().to_vec()),
        Attr::Value(der.to_vec()),
    ]
}
