//! Vendor extension for CP5 key authorization.
//!
//! Struct layouts mirror the vendor header byte for byte: field order as
//! declared, pointers native-sized, integers `CK_ULONG` wide. Keep these
//! `#[repr(C)]` definitions hand-written; a reflected layout is unsafe.

#![allow(non_snake_case, non_camel_case_types)]

use cryptoki_sys::CKM_VENDOR_DEFINED;
use cryptoki_sys::CK_BYTE;
use cryptoki_sys::CK_BYTE_PTR;
use cryptoki_sys::CK_MECHANISM_TYPE;
use cryptoki_sys::CK_ULONG;

pub const CKM_CP5_INITIALIZE: CK_MECHANISM_TYPE = CKM_VENDOR_DEFINED | 0x9101;
pub const CKM_CP5_AUTHORIZE: CK_MECHANISM_TYPE = CKM_VENDOR_DEFINED | 0x9102;

/// Authorization protocol selector: RSASSA-PSS with SHA-256.
pub const CP5_KEY_AUTH_PROT_RSA_PSS_SHA256: CK_ULONG = 2;

/// `bAssigned` value marking the key as bound to its authorization key.
pub const CP5_KEY_AUTHORIZATION_ASSIGNED: CK_BYTE = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CK_CP5_AUTH_DATA {
    pub ulModulusLen: CK_ULONG,
    pub pModulus: CK_BYTE_PTR,
    pub ulPublicExponentLen: CK_ULONG,
    pub pPublicExponent: CK_BYTE_PTR,
    pub protocol: CK_ULONG,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CK_CP5_INITIALIZE_PARAMS {
    pub authData: CK_CP5_AUTH_DATA,
    pub bAssigned: CK_BYTE,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CK_CP5_AUTHORIZE_PARAMS {
    pub ulCount: CK_ULONG,
}

/// High-level form of the CP5 parameter blocks, marshalled at the FFI
/// border by [`super::CryptokiModule`].
#[derive(Debug, Clone, Copy)]
pub enum Cp5Params<'a> {
    Initialize {
        /// KAK modulus, left-padded to the full modulus byte length.
        modulus: &'a [u8],
        /// KAK public exponent, left-padded to three bytes.
        public_exponent: &'a [u8],
        assigned: bool,
    },
    Authorize {
        operations: u64,
    },
}
