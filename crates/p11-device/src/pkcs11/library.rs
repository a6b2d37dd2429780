use camino::Utf8Path;
use cryptoki_sys::CKF_OS_LOCKING_OK;
use cryptoki_sys::CKF_RW_SESSION;
use cryptoki_sys::CKF_SERIAL_SESSION;
use cryptoki_sys::CKR_ATTRIBUTE_SENSITIVE;
use cryptoki_sys::CKR_ATTRIBUTE_TYPE_INVALID;
use cryptoki_sys::CKR_CRYPTOKI_ALREADY_INITIALIZED;
use cryptoki_sys::CKR_OK;
use cryptoki_sys::CKU_USER;
use cryptoki_sys::CK_ATTRIBUTE;
use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_BYTE_PTR;
use cryptoki_sys::CK_C_INITIALIZE_ARGS;
use cryptoki_sys::CK_FUNCTION_LIST;
use cryptoki_sys::CK_FUNCTION_LIST_PTR;
use cryptoki_sys::CK_MECHANISM;
use cryptoki_sys::CK_MECHANISM_PTR;
use cryptoki_sys::CK_OBJECT_HANDLE;
use cryptoki_sys::CK_RV;
use cryptoki_sys::CK_SESSION_HANDLE;
use cryptoki_sys::CK_TOKEN_INFO;
use cryptoki_sys::CK_ULONG;
use cryptoki_sys::CK_ULONG_PTR;
use cryptoki_sys::CK_UNAVAILABLE_INFORMATION;
use cryptoki_sys::CK_VOID_PTR;
use libloading::Library;
use std::ptr;
use tracing::debug;
use tracing::trace;

use super::vendor::CKM_CP5_AUTHORIZE;
use super::vendor::CKM_CP5_INITIALIZE;
use super::vendor::CK_CP5_AUTHORIZE_PARAMS;
use super::vendor::CK_CP5_AUTH_DATA;
use super::vendor::CK_CP5_INITIALIZE_PARAMS;
use super::vendor::CP5_KEY_AUTHORIZATION_ASSIGNED;
use super::vendor::CP5_KEY_AUTH_PROT_RSA_PSS_SHA256;
use super::Attr;
use super::Cp5Params;
use super::Cryptoki;
use super::Mechanism;
use super::ObjectHandle;
use super::SessionHandle;
use super::SlotId;
use super::TokenInfo;
use super::KEY_AUTHORIZATION_HASH_LEN;
use crate::error::P11Error;

type GetFunctionListFn = unsafe extern "C" fn(*mut CK_FUNCTION_LIST_PTR) -> CK_RV;
type AuthorizeKeyInitFn = unsafe extern "C" fn(
    CK_SESSION_HANDLE,
    CK_MECHANISM_PTR,
    CK_OBJECT_HANDLE,
    CK_BYTE_PTR,
    CK_ULONG_PTR,
) -> CK_RV;
type AuthorizeKeyFn = unsafe extern "C" fn(CK_SESSION_HANDLE, CK_BYTE_PTR, CK_ULONG) -> CK_RV;

fn check(call: &'static str, rv: CK_RV) -> Result<(), P11Error> {
    if rv == CKR_OK {
        Ok(())
    } else {
        Err(P11Error::Cryptoki { call, rv })
    }
}

/// Owned marshalled form of an [`Attr`] template.
///
/// The attribute values are boxed so the `CK_ATTRIBUTE` pointers stay
/// valid for the lifetime of the template.
struct Template {
    _values: Vec<Box<[u8]>>,
    raw: Vec<CK_ATTRIBUTE>,
}

impl Template {
    fn new(attrs: &[Attr]) -> Self {
        let values: Vec<Box<[u8]>> = attrs
            .iter()
            .map(|attr| attr.value_bytes().into_boxed_slice())
            .collect();
        let raw = attrs
            .iter()
            .zip(&values)
            .map(|(attr, value)| CK_ATTRIBUTE {
                type_: attr.attribute_type(),
                pValue: value.as_ptr() as CK_VOID_PTR,
                ulValueLen: value.len() as CK_ULONG,
            })
            .collect();
        Template {
            _values: values,
            raw,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut CK_ATTRIBUTE {
        self.raw.as_mut_ptr()
    }

    fn len(&self) -> CK_ULONG {
        self.raw.len() as CK_ULONG
    }
}

/// Builds the raw mechanism, pointing parameters at `iv_storage` when the
/// mechanism carries an IV.
fn raw_mechanism(mechanism: Mechanism, iv_storage: &mut [u8; 16]) -> CK_MECHANISM {
    let mut raw = CK_MECHANISM {
        mechanism: mechanism.mechanism_type(),
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    };
    if let Mechanism::AesCbcPad { iv } = mechanism {
        *iv_storage = iv;
        raw.pParameter = iv_storage.as_mut_ptr().cast();
        raw.ulParameterLen = iv_storage.len() as CK_ULONG;
    }
    raw
}

/// A loaded PKCS#11 module.
///
/// Resolves `C_GetFunctionList` at load time and keeps a copy of the
/// function list; the vendor key-authorization entry points are resolved
/// directly from the library and are optional.
pub struct CryptokiModule {
    functions: CK_FUNCTION_LIST,
    authorize_key_init: Option<AuthorizeKeyInitFn>,
    authorize_key: Option<AuthorizeKeyFn>,
    _library: Library,
}

impl std::fmt::Debug for CryptokiModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiModule")
            .field("cp5", &self.authorize_key_init.is_some())
            .finish()
    }
}

impl CryptokiModule {
    pub fn load(path: &Utf8Path) -> Result<Self, P11Error> {
        let module_load = |source| P11Error::ModuleLoad {
            path: path.to_path_buf(),
            source,
        };
        // SAFETY: loading a PKCS#11 module runs its initialization code;
        // the path is operator-provided and trusted by contract.
        let library = unsafe { Library::new(path.as_std_path()) }.map_err(module_load)?;
        let get_function_list: GetFunctionListFn = unsafe {
            library
                .get::<GetFunctionListFn>(b"C_GetFunctionList")
                .map(|symbol| *symbol)
                .map_err(module_load)?
        };
        let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
        check("C_GetFunctionList", unsafe { get_function_list(&mut list) })?;
        if list.is_null() {
            return Err(P11Error::MissingFunction("C_GetFunctionList"));
        }
        let functions = unsafe { ptr::read(list) };

        let authorize_key_init = unsafe {
            library
                .get::<AuthorizeKeyInitFn>(b"C_AuthorizeKeyInit")
                .map(|symbol| *symbol)
                .ok()
        };
        let authorize_key = unsafe {
            library
                .get::<AuthorizeKeyFn>(b"C_AuthorizeKey")
                .map(|symbol| *symbol)
                .ok()
        };
        if authorize_key_init.is_none() {
            trace!(%path, "module has no CP5 key authorization entry points");
        }

        Ok(CryptokiModule {
            functions,
            authorize_key_init,
            authorize_key,
            _library: library,
        })
    }

    fn func<T: Copy>(&self, name: &'static str, f: Option<T>) -> Result<T, P11Error> {
        f.ok_or(P11Error::MissingFunction(name))
    }
}

impl Cryptoki for CryptokiModule {
    fn initialize(&self) -> Result<(), P11Error> {
        let f = self.func("C_Initialize", self.functions.C_Initialize)?;
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let rv = unsafe { f(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR) };
        if rv == CKR_CRYPTOKI_ALREADY_INITIALIZED {
            debug!("Cryptoki library was already initialized");
            return Ok(());
        }
        check("C_Initialize", rv)
    }

    fn slot_ids(&self, with_tokens: bool) -> Result<Vec<SlotId>, P11Error> {
        let f = self.func("C_GetSlotList", self.functions.C_GetSlotList)?;
        let token_present = u8::from(with_tokens);
        let mut count: CK_ULONG = 0;
        check("C_GetSlotList", unsafe {
            f(token_present, ptr::null_mut(), &mut count)
        })?;
        let mut slots = vec![0 as SlotId; count as usize];
        check("C_GetSlotList", unsafe {
            f(token_present, slots.as_mut_ptr(), &mut count)
        })?;
        slots.truncate(count as usize);
        Ok(slots)
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, P11Error> {
        let f = self.func("C_GetTokenInfo", self.functions.C_GetTokenInfo)?;
        // SAFETY: CK_TOKEN_INFO is plain data, fully written by the library.
        let mut info: CK_TOKEN_INFO = unsafe { std::mem::zeroed() };
        check("C_GetTokenInfo", unsafe { f(slot, &mut info) })?;
        Ok(TokenInfo { label: info.label })
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, P11Error> {
        let f = self.func("C_OpenSession", self.functions.C_OpenSession)?;
        let mut session: SessionHandle = 0;
        check("C_OpenSession", unsafe {
            f(
                slot,
                CKF_SERIAL_SESSION | CKF_RW_SESSION,
                ptr::null_mut(),
                None,
                &mut session,
            )
        })?;
        Ok(session)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), P11Error> {
        let f = self.func("C_CloseSession", self.functions.C_CloseSession)?;
        check("C_CloseSession", unsafe { f(session) })
    }

    fn login(&self, session: SessionHandle, pin: &[u8]) -> Result<(), P11Error> {
        let f = self.func("C_Login", self.functions.C_Login)?;
        check("C_Login", unsafe {
            f(
                session,
                CKU_USER,
                pin.as_ptr() as *mut u8,
                pin.len() as CK_ULONG,
            )
        })
    }

    fn logout(&self, session: SessionHandle) -> Result<(), P11Error> {
        let f = self.func("C_Logout", self.functions.C_Logout)?;
        check("C_Logout", unsafe { f(session) })
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        let init = self.func("C_FindObjectsInit", self.functions.C_FindObjectsInit)?;
        let find = self.func("C_FindObjects", self.functions.C_FindObjects)?;
        let finalize = self.func("C_FindObjectsFinal", self.functions.C_FindObjectsFinal)?;

        let mut template = Template::new(template);
        check("C_FindObjectsInit", unsafe {
            init(session, template.as_mut_ptr(), template.len())
        })?;

        let mut found = Vec::new();
        let result = loop {
            let mut chunk = [0 as ObjectHandle; 16];
            let mut count: CK_ULONG = 0;
            let rv = unsafe {
                find(
                    session,
                    chunk.as_mut_ptr(),
                    chunk.len() as CK_ULONG,
                    &mut count,
                )
            };
            if let Err(err) = check("C_FindObjects", rv) {
                break Err(err);
            }
            found.extend_from_slice(&chunk[..count as usize]);
            if (count as usize) < chunk.len() {
                break Ok(());
            }
        };
        // The search must be finalized even when the find itself failed.
        check("C_FindObjectsFinal", unsafe { finalize(session) })?;
        result?;
        Ok(found)
    }

    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Option<Vec<u8>>, P11Error> {
        let f = self.func("C_GetAttributeValue", self.functions.C_GetAttributeValue)?;
        let mut attr = CK_ATTRIBUTE {
            type_: attribute,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        let rv = unsafe { f(session, object, &mut attr, 1) };
        if rv == CKR_ATTRIBUTE_TYPE_INVALID || rv == CKR_ATTRIBUTE_SENSITIVE {
            return Ok(None);
        }
        check("C_GetAttributeValue", rv)?;
        if attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
            return Ok(None);
        }
        if attr.ulValueLen == 0 {
            return Ok(Some(Vec::new()));
        }

        let mut value = vec![0u8; attr.ulValueLen as usize];
        attr.pValue = value.as_mut_ptr() as CK_VOID_PTR;
        check("C_GetAttributeValue", unsafe {
            f(session, object, &mut attr, 1)
        })?;
        value.truncate(attr.ulValueLen as usize);
        Ok(Some(value))
    }

    fn attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attributes: &[CK_ATTRIBUTE_TYPE],
    ) -> Result<Vec<Option<Vec<u8>>>, P11Error> {
        if attributes.is_empty() {
            return Ok(Vec::new());
        }
        let f = self.func("C_GetAttributeValue", self.functions.C_GetAttributeValue)?;
        let mut template: Vec<CK_ATTRIBUTE> = attributes
            .iter()
            .map(|attribute| CK_ATTRIBUTE {
                type_: *attribute,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect();

        // invalid or sensitive attributes only flag their own entry
        let accepted = |rv: CK_RV| {
            rv == CKR_OK || rv == CKR_ATTRIBUTE_TYPE_INVALID || rv == CKR_ATTRIBUTE_SENSITIVE
        };
        let rv = unsafe { f(session, object, template.as_mut_ptr(), template.len() as CK_ULONG) };
        if !accepted(rv) {
            return Err(P11Error::Cryptoki {
                call: "C_GetAttributeValue",
                rv,
            });
        }

        let mut values: Vec<Option<Vec<u8>>> = template
            .iter()
            .map(|attr| {
                if attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                    None
                } else {
                    Some(vec![0u8; attr.ulValueLen as usize])
                }
            })
            .collect();
        for (attr, value) in template.iter_mut().zip(&mut values) {
            match value {
                Some(buffer) if !buffer.is_empty() => {
                    attr.pValue = buffer.as_mut_ptr() as CK_VOID_PTR;
                }
                // zero-length values need no fetch; unavailable entries are
                // skipped with a null pointer
                _ => attr.ulValueLen = 0,
            }
        }
        let rv = unsafe { f(session, object, template.as_mut_ptr(), template.len() as CK_ULONG) };
        if !accepted(rv) {
            return Err(P11Error::Cryptoki {
                call: "C_GetAttributeValue",
                rv,
            });
        }
        Ok(values)
    }

    fn create_object(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        let f = self.func("C_CreateObject", self.functions.C_CreateObject)?;
        let mut template = Template::new(template);
        let mut object: ObjectHandle = 0;
        check("C_CreateObject", unsafe {
            f(session, template.as_mut_ptr(), template.len(), &mut object)
        })?;
        Ok(object)
    }

    fn destroy_object(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<(), P11Error> {
        let f = self.func("C_DestroyObject", self.functions.C_DestroyObject)?;
        check("C_DestroyObject", unsafe { f(session, object) })
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        let f = self.func("C_GenerateKey", self.functions.C_GenerateKey)?;
        let mut iv = [0u8; 16];
        let mut raw = raw_mechanism(mechanism, &mut iv);
        let mut template = Template::new(template);
        let mut key: ObjectHandle = 0;
        check("C_GenerateKey", unsafe {
            f(
                session,
                &mut raw,
                template.as_mut_ptr(),
                template.len(),
                &mut key,
            )
        })?;
        Ok(key)
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public_template: &[Attr],
        private_template: &[Attr],
    ) -> Result<(ObjectHandle, ObjectHandle), P11Error> {
        let f = self.func("C_GenerateKeyPair", self.functions.C_GenerateKeyPair)?;
        let mut iv = [0u8; 16];
        let mut raw = raw_mechanism(mechanism, &mut iv);
        let mut public_template = Template::new(public_template);
        let mut private_template = Template::new(private_template);
        let mut public_key: ObjectHandle = 0;
        let mut private_key: ObjectHandle = 0;
        check("C_GenerateKeyPair", unsafe {
            f(
                session,
                &mut raw,
                public_template.as_mut_ptr(),
                public_template.len(),
                private_template.as_mut_ptr(),
                private_template.len(),
                &mut public_key,
                &mut private_key,
            )
        })?;
        Ok((public_key, private_key))
    }

    fn wrap_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>, P11Error> {
        let f = self.func("C_WrapKey", self.functions.C_WrapKey)?;
        let mut iv = [0u8; 16];
        let mut raw = raw_mechanism(mechanism, &mut iv);
        let mut len: CK_ULONG = 0;
        check("C_WrapKey", unsafe {
            f(
                session,
                &mut raw,
                wrapping_key,
                key,
                ptr::null_mut(),
                &mut len,
            )
        })?;
        let mut wrapped = vec![0u8; len as usize];
        check("C_WrapKey", unsafe {
            f(
                session,
                &mut raw,
                wrapping_key,
                key,
                wrapped.as_mut_ptr(),
                &mut len,
            )
        })?;
        wrapped.truncate(len as usize);
        Ok(wrapped)
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        let f = self.func("C_UnwrapKey", self.functions.C_UnwrapKey)?;
        let mut iv = [0u8; 16];
        let mut raw = raw_mechanism(mechanism, &mut iv);
        let mut template = Template::new(template);
        let mut key: ObjectHandle = 0;
        check("C_UnwrapKey", unsafe {
            f(
                session,
                &mut raw,
                unwrapping_key,
                wrapped.as_ptr() as *mut u8,
                wrapped.len() as CK_ULONG,
                template.as_mut_ptr(),
                template.len(),
                &mut key,
            )
        })?;
        Ok(key)
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, P11Error> {
        let sign_init = self.func("C_SignInit", self.functions.C_SignInit)?;
        let sign = self.func("C_Sign", self.functions.C_Sign)?;
        let mut iv = [0u8; 16];
        let mut raw = raw_mechanism(mechanism, &mut iv);
        check("C_SignInit", unsafe { sign_init(session, &mut raw, key) })?;

        let mut len: CK_ULONG = 0;
        check("C_Sign", unsafe {
            sign(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                ptr::null_mut(),
                &mut len,
            )
        })?;
        let mut signature = vec![0u8; len as usize];
        check("C_Sign", unsafe {
            sign(
                session,
                data.as_ptr() as *mut u8,
                data.len() as CK_ULONG,
                signature.as_mut_ptr(),
                &mut len,
            )
        })?;
        signature.truncate(len as usize);
        Ok(signature)
    }

    fn authorize_key_init(
        &self,
        session: SessionHandle,
        params: &Cp5Params<'_>,
        key: ObjectHandle,
    ) -> Result<[u8; KEY_AUTHORIZATION_HASH_LEN], P11Error> {
        let f = self
            .authorize_key_init
            .ok_or(P11Error::MissingFunction("C_AuthorizeKeyInit"))?;
        let mut hash = [0u8; KEY_AUTHORIZATION_HASH_LEN];
        let mut hash_len = hash.len() as CK_ULONG;
        let rv = match params {
            Cp5Params::Initialize {
                modulus,
                public_exponent,
                assigned,
            } => {
                let mut block = CK_CP5_INITIALIZE_PARAMS {
                    authData: CK_CP5_AUTH_DATA {
                        ulModulusLen: modulus.len() as CK_ULONG,
                        pModulus: modulus.as_ptr() as CK_BYTE_PTR,
                        ulPublicExponentLen: public_exponent.len() as CK_ULONG,
                        pPublicExponent: public_exponent.as_ptr() as CK_BYTE_PTR,
                        protocol: CP5_KEY_AUTH_PROT_RSA_PSS_SHA256,
                    },
                    bAssigned: if *assigned {
                        CP5_KEY_AUTHORIZATION_ASSIGNED
                    } else {
                        0
                    },
                };
                let mut mechanism = CK_MECHANISM {
                    mechanism: CKM_CP5_INITIALIZE,
                    pParameter: (&mut block as *mut CK_CP5_INITIALIZE_PARAMS).cast(),
                    ulParameterLen: std::mem::size_of::<CK_CP5_INITIALIZE_PARAMS>() as CK_ULONG,
                };
                unsafe { f(session, &mut mechanism, key, hash.as_mut_ptr(), &mut hash_len) }
            }
            Cp5Params::Authorize { operations } => {
                let mut block = CK_CP5_AUTHORIZE_PARAMS {
                    ulCount: *operations as CK_ULONG,
                };
                let mut mechanism = CK_MECHANISM {
                    mechanism: CKM_CP5_AUTHORIZE,
                    pParameter: (&mut block as *mut CK_CP5_AUTHORIZE_PARAMS).cast(),
                    ulParameterLen: std::mem::size_of::<CK_CP5_AUTHORIZE_PARAMS>() as CK_ULONG,
                };
                unsafe { f(session, &mut mechanism, key, hash.as_mut_ptr(), &mut hash_len) }
            }
        };
        check("C_AuthorizeKeyInit", rv)?;
        if hash_len as usize != hash.len() {
            return Err(P11Error::Encoding(format!(
                "unexpected key authorization hash length {hash_len}"
            )));
        }
        Ok(hash)
    }

    fn authorize_key(&self, session: SessionHandle, signature: &[u8]) -> Result<(), P11Error> {
        let f = self
            .authorize_key
            .ok_or(P11Error::MissingFunction("C_AuthorizeKey"))?;
        check("C_AuthorizeKey", unsafe {
            f(
                session,
                signature.as_ptr() as *mut u8,
                signature.len() as CK_ULONG,
            )
        })
    }
}
