//! Thin typed surface over the Cryptoki C ABI.
//!
//! The [`Cryptoki`] trait is the seam between the device layer and the
//! native library: production code goes through [`CryptokiModule`], tests
//! substitute an in-memory token. Templates are expressed as [`Attr`]
//! values and marshalled to `CK_ATTRIBUTE` arrays only at the FFI border.

use cryptoki_sys::CKA_CERTIFICATE_TYPE;
use cryptoki_sys::CKA_CLASS;
use cryptoki_sys::CKA_DECRYPT;
use cryptoki_sys::CKA_DERIVE;
use cryptoki_sys::CKA_ENCRYPT;
use cryptoki_sys::CKA_EXTRACTABLE;
use cryptoki_sys::CKA_ID;
use cryptoki_sys::CKA_ISSUER;
use cryptoki_sys::CKA_KEY_TYPE;
use cryptoki_sys::CKA_LABEL;
use cryptoki_sys::CKA_MODULUS;
use cryptoki_sys::CKA_MODULUS_BITS;
use cryptoki_sys::CKA_PRIVATE;
use cryptoki_sys::CKA_PUBLIC_EXPONENT;
use cryptoki_sys::CKA_SENSITIVE;
use cryptoki_sys::CKA_SERIAL_NUMBER;
use cryptoki_sys::CKA_SIGN;
use cryptoki_sys::CKA_SUBJECT;
use cryptoki_sys::CKA_TOKEN;
use cryptoki_sys::CKA_UNWRAP;
use cryptoki_sys::CKA_VALUE;
use cryptoki_sys::CKA_VALUE_LEN;
use cryptoki_sys::CKA_VERIFY;
use cryptoki_sys::CKA_WRAP;
use cryptoki_sys::CKM_AES_CBC_PAD;
use cryptoki_sys::CKM_AES_KEY_GEN;
use cryptoki_sys::CKM_AES_KEY_WRAP;
use cryptoki_sys::CKM_DES2_KEY_GEN;
use cryptoki_sys::CKM_DES3_KEY_GEN;
use cryptoki_sys::CKM_DES_KEY_GEN;
use cryptoki_sys::CKM_RSA_PKCS;
use cryptoki_sys::CKM_RSA_PKCS_KEY_PAIR_GEN;
use cryptoki_sys::CKM_SHA256_RSA_PKCS;
use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_CERTIFICATE_TYPE;
use cryptoki_sys::CK_KEY_TYPE;
use cryptoki_sys::CK_MECHANISM_TYPE;
use cryptoki_sys::CK_OBJECT_CLASS;
use cryptoki_sys::CK_OBJECT_HANDLE;
use cryptoki_sys::CK_SESSION_HANDLE;
use cryptoki_sys::CK_SLOT_ID;
use cryptoki_sys::CK_ULONG;

use crate::error::P11Error;

mod library;
mod vendor;

pub use library::CryptokiModule;
pub use vendor::Cp5Params;
pub use vendor::CKM_CP5_AUTHORIZE;
pub use vendor::CKM_CP5_INITIALIZE;
pub use vendor::CP5_KEY_AUTH_PROT_RSA_PSS_SHA256;
pub use vendor::CP5_KEY_AUTHORIZATION_ASSIGNED;
pub use vendor::CK_CP5_AUTHORIZE_PARAMS;
pub use vendor::CK_CP5_AUTH_DATA;
pub use vendor::CK_CP5_INITIALIZE_PARAMS;

pub type SlotId = CK_SLOT_ID;
pub type SessionHandle = CK_SESSION_HANDLE;
pub type ObjectHandle = CK_OBJECT_HANDLE;

/// Byte length of the hash returned by `C_AuthorizeKeyInit`.
pub const KEY_AUTHORIZATION_HASH_LEN: usize = 32;

/// Token information needed by the device layer.
#[derive(Debug, Clone, Copy)]
pub struct TokenInfo {
    /// Raw token label, space-padded to 32 bytes per the standard.
    pub label: [u8; 32],
}

/// One template attribute, owned form.
///
/// Booleans marshal to a single `CK_BBOOL` byte, numeric attributes to a
/// native-endian `CK_ULONG`, everything else to its raw byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attr {
    Class(CK_OBJECT_CLASS),
    CertificateType(CK_CERTIFICATE_TYPE),
    KeyType(CK_KEY_TYPE),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Encrypt(bool),
    Decrypt(bool),
    Sign(bool),
    Verify(bool),
    Wrap(bool),
    Unwrap(bool),
    Derive(bool),
    Label(Vec<u8>),
    Id(Vec<u8>),
    Subject(Vec<u8>),
    Issuer(Vec<u8>),
    /// DER-encoded certificate serial number.
    SerialNumber(Vec<u8>),
    Value(Vec<u8>),
    Modulus(Vec<u8>),
    PublicExponent(Vec<u8>),
    ModulusBits(CK_ULONG),
    ValueLen(CK_ULONG),
}

impl Attr {
    pub fn attribute_type(&self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Attr::Class(_) => CKA_CLASS,
            Attr::CertificateType(_) => CKA_CERTIFICATE_TYPE,
            Attr::KeyType(_) => CKA_KEY_TYPE,
            Attr::Token(_) => CKA_TOKEN,
            Attr::Private(_) => CKA_PRIVATE,
            Attr::Sensitive(_) => CKA_SENSITIVE,
            Attr::Extractable(_) => CKA_EXTRACTABLE,
            Attr::Encrypt(_) => CKA_ENCRYPT,
            Attr::Decrypt(_) => CKA_DECRYPT,
            Attr::Sign(_) => CKA_SIGN,
            Attr::Verify(_) => CKA_VERIFY,
            Attr::Wrap(_) => CKA_WRAP,
            Attr::Unwrap(_) => CKA_UNWRAP,
            Attr::Derive(_) => CKA_DERIVE,
            Attr::Label(_) => CKA_LABEL,
            Attr::Id(_) => CKA_ID,
            Attr::Subject(_) => CKA_SUBJECT,
            Attr::Issuer(_) => CKA_ISSUER,
            Attr::SerialNumber(_) => CKA_SERIAL_NUMBER,
            Attr::Value(_) => CKA_VALUE,
            Attr::Modulus(_) => CKA_MODULUS,
            Attr::PublicExponent(_) => CKA_PUBLIC_EXPONENT,
            Attr::ModulusBits(_) => CKA_MODULUS_BITS,
            Attr::ValueLen(_) => CKA_VALUE_LEN,
        }
    }

    /// The attribute value as the byte string handed to the library.
    pub fn value_bytes(&self) -> Vec<u8> {
        match self {
            Attr::Class(v) | Attr::CertificateType(v) | Attr::KeyType(v) => {
                v.to_ne_bytes().to_vec()
            }
            Attr::ModulusBits(v) | Attr::ValueLen(v) => v.to_ne_bytes().to_vec(),
            Attr::Token(v)
            | Attr::Private(v)
            | Attr::Sensitive(v)
            | Attr::Extractable(v)
            | Attr::Encrypt(v)
            | Attr::Decrypt(v)
            | Attr::Sign(v)
            | Attr::Verify(v)
            | Attr::Wrap(v)
            | Attr::Unwrap(v)
            | Attr::Derive(v) => vec![u8::from(*v)],
            Attr::Label(v)
            | Attr::Id(v)
            | Attr::Subject(v)
            | Attr::Issuer(v)
            | Attr::SerialNumber(v)
            | Attr::Value(v)
            | Attr::Modulus(v)
            | Attr::PublicExponent(v) => v.clone(),
        }
    }
}

/// Mechanisms the device layer drives, with their parameters.
///
/// `Raw` passes an arbitrary parameterless mechanism code through, for
/// wrap ciphers picked by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,
    RsaPkcs,
    Sha256RsaPkcs,
    DesKeyGen,
    Des2KeyGen,
    Des3KeyGen,
    AesKeyGen,
    AesKeyWrap,
    AesCbcPad { iv: [u8; 16] },
    Raw(CK_MECHANISM_TYPE),
}

impl Mechanism {
    pub fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        match self {
            Mechanism::RsaPkcsKeyPairGen => CKM_RSA_PKCS_KEY_PAIR_GEN,
            Mechanism::RsaPkcs => CKM_RSA_PKCS,
            Mechanism::Sha256RsaPkcs => CKM_SHA256_RSA_PKCS,
            Mechanism::DesKeyGen => CKM_DES_KEY_GEN,
            Mechanism::Des2KeyGen => CKM_DES2_KEY_GEN,
            Mechanism::Des3KeyGen => CKM_DES3_KEY_GEN,
            Mechanism::AesKeyGen => CKM_AES_KEY_GEN,
            Mechanism::AesKeyWrap => CKM_AES_KEY_WRAP,
            Mechanism::AesCbcPad { .. } => CKM_AES_CBC_PAD,
            Mechanism::Raw(mechanism) => *mechanism,
        }
    }
}

/// Typed operations over one loaded Cryptoki library.
///
/// Every method is a potential blocking point: implementations talk to the
/// HSM synchronously. Callers must not hold slot-level locks across these
/// calls.
pub trait Cryptoki: Send + Sync {
    /// `C_Initialize`. An "already initialized" response is success.
    fn initialize(&self) -> Result<(), P11Error>;

    fn slot_ids(&self, with_tokens: bool) -> Result<Vec<SlotId>, P11Error>;

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, P11Error>;

    /// Opens a read-write serial session.
    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, P11Error>;

    fn close_session(&self, session: SessionHandle) -> Result<(), P11Error>;

    fn login(&self, session: SessionHandle, pin: &[u8]) -> Result<(), P11Error>;

    fn logout(&self, session: SessionHandle) -> Result<(), P11Error>;

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<Vec<ObjectHandle>, P11Error>;

    /// Reads one attribute. `Ok(None)` when the object does not carry the
    /// attribute or the token refuses to reveal it.
    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Option<Vec<u8>>, P11Error>;

    /// Batched attribute read; one `None` per absent or withheld value.
    fn attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> Result<Vec<Option<Vec<u8>>>, P11Error> {
        attributes
            .iter()
            .map(|attribute| self.attribute(session, object, *attribute))
            .collect()
    }

    fn create_object(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error>;

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle)
        -> Result<(), P11Error>;

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error>;

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public_template: &[Attr],
        private_template: &[Attr],
    ) -> Result<(ObjectHandle, ObjectHandle), P11Error>;

    fn wrap_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>, P11Error>;

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error>;

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, P11Error>;

    /// Vendor `C_AuthorizeKeyInit`; returns the hash to be signed with the
    /// key authorization key.
    fn authorize_key_init(
        &self,
        session: SessionHandle,
        params: &Cp5Params<'_>,
        key: ObjectHandle,
    ) -> Result<[u8; KEY_AUTHORIZATION_HASH_LEN], P11Error>;

    /// Vendor `C_AuthorizeKey`; submits the signature over the hash.
    fn authorize_key(&self, session: SessionHandle, signature: &[u8]) -> Result<(), P11Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::CKO_CERTIFICATE;

    #[test]
    fn bool_attributes_marshal_to_one_byte() {
        assert_eq!(Attr::Token(true).value_bytes(), vec![1]);
        assert_eq!(Attr::Sensitive(false).value_bytes(), vec![0]);
    }

    #[test]
    fn numeric_attributes_marshal_to_native_ulong() {
        let bytes = Attr::ModulusBits(2048).value_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<CK_ULONG>());
        assert_eq!(bytes, 2048u64.to_ne_bytes()[..bytes.len()].to_vec());
    }

    #[test]
    fn byte_attributes_marshal_verbatim() {
        let attr = Attr::Label(b"signKey001".to_vec());
        assert_eq!(attr.attribute_type(), CKA_LABEL);
        assert_eq!(attr.value_bytes(), b"signKey001");
    }

    #[test]
    fn class_attribute_has_object_class_width() {
        let bytes = Attr::Class(CKO_CERTIFICATE).value_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<CK_OBJECT_CLASS>());
    }
}
