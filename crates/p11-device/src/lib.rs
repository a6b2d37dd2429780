//! Pooled, caching device abstraction over PKCS#11 modules.
//!
//! A [`Device`] owns one loaded Cryptoki library and indexes its slots;
//! a [`Slot`] pools read-write sessions, memoizes object searches and
//! exposes the key and certificate operations signing services need:
//! alias-based key lookup, RSA and symmetric key generation, private-key
//! wrap/unwrap, certificate chain import and retrieval, and the vendor
//! CP5 key-authorization handshake.
//!
//! Keys are handed out as opaque signing handles; callers never touch
//! session ids. All native calls are blocking and may be issued from
//! multiple threads sharing one device.

mod authorize;
mod cache;
mod certs;
mod config;
mod device;
mod error;
mod keys;
mod pkcs11;
mod pool;
mod resolver;
mod slot;

#[cfg(test)]
pub(crate) mod testing;

pub use authorize::KeyAuthorizationKey;
pub use authorize::KAK_PSS_SALT_LEN;
pub use authorize::KAK_PUBLIC_EXPONENT_LEN;
pub use certs::MAX_CHAIN_LENGTH;
pub use config::DeviceConfig;
pub use config::SlotConfig;
pub use device::Device;
pub use error::P11Error;
pub use keys::AliasEntry;
pub use keys::Aliases;
pub use keys::CertificateGenerator;
pub use keys::GeneratedKeyData;
pub use keys::KeyEntryKind;
pub use keys::KeyPairRequest;
pub use keys::PrivateKey;
pub use keys::SecretKey;
pub use pkcs11::Attr;
pub use pkcs11::Cp5Params;
pub use pkcs11::Cryptoki;
pub use pkcs11::CryptokiModule;
pub use pkcs11::Mechanism;
pub use pkcs11::ObjectHandle;
pub use pkcs11::SessionHandle;
pub use pkcs11::SlotId;
pub use pkcs11::TokenInfo;
pub use pkcs11::KEY_AUTHORIZATION_HASH_LEN;
pub use slot::Slot;
