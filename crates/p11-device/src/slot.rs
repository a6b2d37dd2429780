//! One slot of a device: session pool, attribute cache, login state.
//!
//! All pool and cache mutations happen under the per-slot mutex. The lock
//! is never held across a native library call; the call happens between a
//! check/rotate of the collections and the write-back.

use cryptoki_sys::CKR_USER_ALREADY_LOGGED_IN;
use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_OBJECT_CLASS;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use tracing::debug;
use tracing::warn;
use zeroize::Zeroizing;

use crate::cache::AttributeCache;
use crate::cache::SearchKey;
use crate::error::P11Error;
use crate::pkcs11::Attr;
use crate::pkcs11::Cryptoki;
use crate::pkcs11::ObjectHandle;
use crate::pkcs11::SessionHandle;
use crate::pkcs11::SlotId;
use crate::pool::Released;
use crate::pool::SessionPool;

/// Idle sessions kept per slot; releases beyond this close the session.
const MAX_IDLE_SESSIONS: usize = 8;

pub(crate) struct SlotState {
    pub pool: SessionPool,
    pub cache: AttributeCache,
    pub use_cache: bool,
}

/// A slot with a present token.
///
/// Obtained from [`crate::Device`]; all key, certificate and
/// authorization operations hang off this type.
pub struct Slot {
    pub(crate) api: Arc<dyn Cryptoki>,
    id: SlotId,
    label: Option<String>,
    state: Mutex<SlotState>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl Slot {
    pub(crate) fn new(api: Arc<dyn Cryptoki>, id: SlotId, label: Option<String>) -> Self {
        Slot {
            api,
            id,
            label,
            state: Mutex::new(SlotState {
                pool: SessionPool::default(),
                cache: AttributeCache::default(),
                use_cache: true,
            }),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The token label, when it decoded as valid UTF-8.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Enables or disables the per-slot attribute cache. Disabling drops
    /// all cached entries.
    pub fn set_use_cache(&self, use_cache: bool) {
        let mut state = self.lock();
        state.use_cache = use_cache;
        if !use_cache {
            state.cache.clear();
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an idle session or opens a new one. An open failure means the
    /// token is unreachable and surfaces as [`P11Error::Offline`].
    pub(crate) fn acquire_session(&self) -> Result<SessionHandle, P11Error> {
        if let Some(session) = self.lock().pool.take_idle() {
            return Ok(session);
        }
        let session = self.api.open_session(self.id).map_err(|err| match err {
            P11Error::Cryptoki { call, rv } => P11Error::Offline { call, rv },
            other => other,
        })?;
        self.lock().pool.adopt_active(session);
        Ok(session)
    }

    pub(crate) fn release_session(&self, session: SessionHandle) {
        let idle_len = self.lock().pool.idle_len();
        if idle_len >= MAX_IDLE_SESSIONS {
            self.close_session(session);
            return;
        }
        if self.lock().pool.release(session) == Released::Unknown {
            warn!(
                slot = self.id,
                session, "released a session the pool does not know"
            );
        }
    }

    pub(crate) fn close_session(&self, session: SessionHandle) {
        if let Err(err) = self.api.close_session(session) {
            warn!(slot = self.id, session, error = %err, "C_CloseSession failed");
        }
        if self.lock().pool.close(session) {
            warn!(
                slot = self.id,
                session, "closed session was still in the idle stack"
            );
        }
    }

    /// Acquires a session that is released back to the pool on drop.
    pub(crate) fn session(&self) -> Result<PooledSession<'_>, P11Error> {
        let handle = self.acquire_session()?;
        Ok(PooledSession {
            slot: self,
            handle,
            detached: false,
        })
    }

    /// Logs the user into the token, retaining a dedicated login session.
    pub fn login(&self, pin: &str) -> Result<(), P11Error> {
        // the guard must not live into the match arms: acquire_session
        // locks this mutex again
        let login_session = self.lock().pool.login_session();
        let (session, newly_acquired) = match login_session {
            Some(session) => (session, false),
            None => (self.acquire_session()?, true),
        };
        if newly_acquired {
            self.lock().pool.set_login(session);
        }
        let pin = Zeroizing::new(pin.as_bytes().to_vec());
        match self.api.login(session, &pin) {
            Ok(()) => Ok(()),
            Err(err) if err.is_rv(CKR_USER_ALREADY_LOGGED_IN) => {
                debug!(slot = self.id, "user was already logged in");
                Ok(())
            }
            Err(err) => {
                if newly_acquired {
                    let mut state = self.lock();
                    state.pool.take_login();
                    state.pool.release(session);
                }
                Err(err)
            }
        }
    }

    /// Logs out and returns the login session to the pool. A second call
    /// is a no-op; native logout failures are logged, the release runs on
    /// every path.
    pub fn logout(&self) -> Result<(), P11Error> {
        let Some(session) = self.lock().pool.take_login() else {
            debug!(slot = self.id, "logout without a login session");
            return Ok(());
        };
        if let Err(err) = self.api.logout(session) {
            warn!(slot = self.id, error = %err, "C_Logout failed");
        }
        self.release_session(session);
        Ok(())
    }

    /// Object search going through the attribute cache, including negative
    /// results. `token_bound` adds `CKA_TOKEN = true` to the template.
    pub(crate) fn find_cached(
        &self,
        session: SessionHandle,
        class: CK_OBJECT_CLASS,
        search: Attr,
        token_bound: bool,
    ) -> Result<Vec<ObjectHandle>, P11Error> {
        let key = SearchKey {
            class,
            attribute: search.attribute_type(),
            value: search.value_bytes(),
        };
        {
            let state = self.lock();
            if state.use_cache {
                if let Some(objects) = state.cache.get_objects(&key) {
                    return Ok(objects);
                }
            }
        }

        let mut template = vec![Attr::Class(class)];
        if token_bound {
            template.push(Attr::Token(true));
        }
        template.push(search);
        let objects = self.api.find_objects(session, &template)?;

        let mut state = self.lock();
        if state.use_cache {
            state.cache.add_objects(key, &objects);
        }
        Ok(objects)
    }

    /// Attribute read going through the cache. Absent values are returned
    /// as `None` and never cached.
    pub(crate) fn object_attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Option<Vec<u8>>, P11Error> {
        {
            let state = self.lock();
            if state.use_cache && state.cache.attribute_exists(object, attribute) {
                return Ok(state.cache.get_attribute(object, attribute));
            }
        }

        let value = self.api.attribute(session, object, attribute)?;

        if let Some(value) = &value {
            let mut state = self.lock();
            if state.use_cache {
                state.cache.add_attribute(object, attribute, value.clone());
            }
        }
        Ok(value)
    }

    /// Destroys an object and scrubs every cache entry referring to it.
    pub(crate) fn destroy_object_invalidating(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
    ) -> Result<(), P11Error> {
        self.api.destroy_object(session, object)?;
        self.lock().cache.remove_all_by_object(object);
        Ok(())
    }

    /// Creates an object and purges cached searches (negative ones above
    /// all) for every identifying value the new object carries.
    pub(crate) fn create_object_invalidating(
        &self,
        session: SessionHandle,
        template: &[Attr],
    ) -> Result<ObjectHandle, P11Error> {
        let object = self.api.create_object(session, template)?;
        let mut state = self.lock();
        for attr in template {
            match attr {
                Attr::Label(value) | Attr::Id(value) | Attr::Subject(value) => {
                    state.cache.remove_by_label(value);
                }
                _ => {}
            }
        }
        Ok(object)
    }

    /// Purges cached searches for an alias after key material under that
    /// alias changed.
    pub(crate) fn invalidate_alias(&self, alias: &str) {
        self.lock().cache.remove_by_label(alias.as_bytes());
    }
}

/// RAII session lease; goes back to the pool top on drop.
pub(crate) struct PooledSession<'a> {
    slot: &'a Slot,
    handle: SessionHandle,
    detached: bool,
}

impl PooledSession<'_> {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Keeps the session active and out of the pool; used by keys that own
    /// their session.
    pub fn detach(mut self) -> SessionHandle {
        self.detached = true;
        self.handle
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if !self.detached {
            self.slot.release_session(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeToken;
    use assert_matches::assert_matches;

    fn slot_over(api: Arc<FakeToken>) -> Slot {
        Slot::new(api, 1, Some("TEST TOKEN".into()))
    }

    #[test]
    fn sessions_are_pooled_lifo() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());

        let first = slot.acquire_session().unwrap();
        slot.release_session(first);
        let second = slot.acquire_session().unwrap();
        assert_eq!(first, second);
        assert_eq!(api.calls("C_OpenSession"), 1);
    }

    #[test]
    fn acquire_surfaces_offline_when_open_fails() {
        let api = FakeToken::new();
        api.fail_open_session();
        let slot = slot_over(api);

        assert_matches!(slot.acquire_session(), Err(P11Error::Offline { .. }));
    }

    #[test]
    fn guard_releases_on_all_paths() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());

        let handle = {
            let guard = slot.session().unwrap();
            guard.handle()
        };
        // back on the idle stack, so the next acquire reuses it
        assert_eq!(slot.acquire_session().unwrap(), handle);
    }

    #[test]
    fn login_retains_a_dedicated_session() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());

        slot.login("1234").unwrap();
        let login = slot.lock().pool.login_session().unwrap();

        // the login session is not handed out to operations
        let other = slot.acquire_session().unwrap();
        assert_ne!(login, other);
    }

    #[test]
    fn second_login_is_benign() {
        let api = FakeToken::new();
        let slot = slot_over(api);
        slot.login("1234").unwrap();
        slot.login("1234").unwrap();
    }

    #[test]
    fn logout_is_idempotent_and_releases() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());

        slot.login("1234").unwrap();
        let login = slot.lock().pool.login_session().unwrap();
        slot.logout().unwrap();
        slot.logout().unwrap();
        assert!(!api.logged_in());

        // the former login session went back to the idle stack
        assert_eq!(slot.acquire_session().unwrap(), login);
    }

    #[test]
    fn surplus_idle_sessions_are_closed() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());

        let sessions: Vec<_> = (0..MAX_IDLE_SESSIONS + 2)
            .map(|_| slot.acquire_session().unwrap())
            .collect();
        for session in sessions {
            slot.release_session(session);
        }
        assert_eq!(api.calls("C_CloseSession"), 2);
        assert_eq!(slot.lock().pool.idle_len(), MAX_IDLE_SESSIONS);
    }

    #[test]
    fn disabling_the_cache_clears_it() {
        let api = FakeToken::new();
        let slot = slot_over(api.clone());
        let session = slot.acquire_session().unwrap();

        slot.find_cached(
            session,
            cryptoki_sys::CKO_CERTIFICATE,
            Attr::Label(b"missing".to_vec()),
            true,
        )
        .unwrap();
        assert_eq!(api.calls("C_FindObjectsInit"), 1);

        // cached negative short-circuits the second search
        slot.find_cached(
            session,
            cryptoki_sys::CKO_CERTIFICATE,
            Attr::Label(b"missing".to_vec()),
            true,
        )
        .unwrap();
        assert_eq!(api.calls("C_FindObjectsInit"), 1);

        slot.set_use_cache(false);
        slot.find_cached(
            session,
            cryptoki_sys::CKO_CERTIFICATE,
            Attr::Label(b"missing".to_vec()),
            true,
        )
        .unwrap();
        assert_eq!(api.calls("C_FindObjectsInit"), 2);
    }
}
