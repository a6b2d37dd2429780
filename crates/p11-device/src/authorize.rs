//! CP5 key authorization.
//!
//! Binds an HSM private key to an externally held key authorization key
//! (KAK). Both phases run the same handshake: the vendor init call hands
//! back a 32-byte hash, the KAK holder signs it with RSASSA-PSS/SHA-256,
//! and the signature is submitted to conclude the operation.

use rand::thread_rng;
use rsa::pss::Pss;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use sha2::Sha256;
use tracing::debug;

use crate::error::P11Error;
use crate::pkcs11::Cp5Params;
use crate::slot::Slot;

/// PSS salt length used throughout the authorization protocol.
pub const KAK_PSS_SALT_LEN: usize = 32;

/// The KAK public exponent is marshalled into exactly three bytes.
pub const KAK_PUBLIC_EXPONENT_LEN: usize = 3;

/// A key authorization key: the caller-held RSA key pair whose holder
/// authorises use of an HSM private key.
///
/// Implemented for [`rsa::RsaPrivateKey`]; an HSM-backed or remote KAK
/// can implement it instead.
pub trait KeyAuthorizationKey {
    fn public_key(&self) -> RsaPublicKey;

    /// Signs the 32-byte authorization hash with RSASSA-PSS, SHA-256
    /// digest, MGF1/SHA-256 and a 32-byte salt.
    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, P11Error>;
}

impl KeyAuthorizationKey for RsaPrivateKey {
    fn public_key(&self) -> RsaPublicKey {
        self.to_public_key()
    }

    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, P11Error> {
        self.sign_with_rng(
            &mut thread_rng(),
            Pss::new_with_salt::<Sha256>(KAK_PSS_SALT_LEN),
            digest,
        )
        .map_err(|err| P11Error::KeyAuthorization(format!("PSS signing failed: {err}")))
    }
}

/// Serializes the KAK public parts into the fixed-layout parameter
/// blocks: modulus left-padded to the full modulus byte length, exponent
/// left-padded to three bytes.
fn kak_parameter_blocks(
    public: &RsaPublicKey,
) -> Result<(Vec<u8>, [u8; KAK_PUBLIC_EXPONENT_LEN]), P11Error> {
    let modulus_len = public.size();
    let raw_modulus = public.n().to_bytes_be();
    if raw_modulus.len() > modulus_len {
        return Err(P11Error::KeyAuthorization(format!(
            "KAK modulus of {} bytes exceeds the key size of {modulus_len} bytes",
            raw_modulus.len()
        )));
    }
    let mut modulus = vec![0u8; modulus_len];
    modulus[modulus_len - raw_modulus.len()..].copy_from_slice(&raw_modulus);

    let raw_exponent = public.e().to_bytes_be();
    if raw_exponent.len() > KAK_PUBLIC_EXPONENT_LEN {
        return Err(P11Error::KeyAuthorization(format!(
            "KAK public exponent of {} bytes does not fit in {KAK_PUBLIC_EXPONENT_LEN} bytes",
            raw_exponent.len()
        )));
    }
    let mut exponent = [0u8; KAK_PUBLIC_EXPONENT_LEN];
    exponent[KAK_PUBLIC_EXPONENT_LEN - raw_exponent.len()..].copy_from_slice(&raw_exponent);

    Ok((modulus, exponent))
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Initialize,
    Authorize { operations: u64 },
}

impl Slot {
    /// Binds the private key behind `alias` to the given KAK.
    pub fn key_authorize_init(
        &self,
        alias: &str,
        kak: &dyn KeyAuthorizationKey,
    ) -> Result<(), P11Error> {
        self.run_authorization(alias, kak, Phase::Initialize)
    }

    /// Authorizes `operations` uses of the private key behind `alias`.
    pub fn key_authorize(
        &self,
        alias: &str,
        kak: &dyn KeyAuthorizationKey,
        operations: u64,
    ) -> Result<(), P11Error> {
        self.run_authorization(alias, kak, Phase::Authorize { operations })
    }

    fn run_authorization(
        &self,
        alias: &str,
        kak: &dyn KeyAuthorizationKey,
        phase: Phase,
    ) -> Result<(), P11Error> {
        let guard = self.session()?;
        let session = guard.handle();
        let key = self
            .private_key_for_alias(session, alias)?
            .ok_or_else(|| P11Error::NotFound {
                what: "private key",
                alias: alias.to_string(),
            })?;

        let public = kak.public_key();
        let (modulus, exponent) = kak_parameter_blocks(&public)?;
        let params = match phase {
            Phase::Initialize => Cp5Params::Initialize {
                modulus: &modulus,
                public_exponent: &exponent,
                assigned: true,
            },
            Phase::Authorize { operations } => Cp5Params::Authorize { operations },
        };

        let hash = self.api.authorize_key_init(session, &params, key)?;
        let signature = kak.sign_digest(&hash)?;
        self.api.authorize_key(session, &signature)?;
        debug!(slot = self.id(), alias, ?phase, "key authorization complete");
        Ok(())
    }
}
