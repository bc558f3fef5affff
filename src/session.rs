//! Session store with timeout-based expiry.
//!
//! Every session lives in one map behind one lock. The sweeper thread and
//! request handlers both go through that lock; there is no per-session
//! locking.

use crate::error::ServerResult;
use crate::request::Request;
use crate::response::{Cookie, Response};
use crossbeam::channel::{self, select, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State kept for one client
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    created: u64,
    last_access: u64,
    hits: u64,
    values: HashMap<String, Value>,
}

impl Session {
    fn new(id: String, now: u64) -> Self {
        Self {
            id,
            created: now,
            last_access: now,
            hits: 0,
            values: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time, epoch milliseconds
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Last access, epoch milliseconds
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    /// Number of requests that used this session
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) -> Option<Value> {
        self.values.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Record an access. The timestamp never moves backwards.
    fn touch(&mut self, now: u64) {
        self.last_access = self.last_access.max(now);
        self.hits += 1;
    }

    fn is_expired(&self, timeout_ms: u64, now: u64) -> bool {
        self.last_access.saturating_add(timeout_ms) < now
    }
}

/// All live sessions
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    counter: AtomicU64,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// A new id: 18 random bytes from the OS, base64url-encoded, followed
    /// by a hexadecimal sequence number.
    pub fn generate_id(&self) -> String {
        let mut random = [0u8; 18];
        OsRng.fill_bytes(&mut random);
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}{:x}",
            base64::encode_config(random, base64::URL_SAFE_NO_PAD),
            seq
        )
    }

    /// Create a session and return its id
    pub fn create(&self) -> String {
        self.create_at(now_millis())
    }

    /// Create a session whose last access is `now` (epoch milliseconds)
    pub fn create_at(&self, now: u64) -> String {
        let id = self.generate_id();
        self.sessions
            .lock()
            .insert(id.clone(), Session::new(id.clone(), now));
        id
    }

    /// Bump a live session's timestamp and hit counter. An expired
    /// session is dropped and `false` returned.
    pub fn touch(&self, id: &str) -> bool {
        self.touch_at(id, now_millis())
    }

    pub fn touch_at(&self, id: &str, now: u64) -> bool {
        let timeout_ms = self.timeout_ms();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) if !session.is_expired(timeout_ms, now) => {
                session.touch(now);
                true
            }
            Some(_) => {
                sessions.remove(id);
                false
            }
            None => false,
        }
    }

    /// Run `f` on a session under the store lock
    pub fn with_session<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        self.sessions.lock().get_mut(id).map(f)
    }

    /// Copy of a session's current state
    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Remove a session; returns whether it existed
    pub fn invalidate(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Remove every session expired at `now`; returns how many went
    pub fn sweep_at(&self, now: u64) -> usize {
        let timeout_ms = self.timeout_ms();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(timeout_ms, now));
        before - sessions.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(now_millis())
    }

    /// Attach a session to `request`, reusing the one named by its
    /// `cookie_name` cookie when still alive, otherwise creating one and
    /// setting the cookie on `response`.
    pub fn resolve(
        self: &Arc<Self>,
        request: &mut Request,
        response: &mut Response<'_>,
        cookie_name: &str,
    ) -> ServerResult<SessionHandle> {
        let existing = request
            .cookie(cookie_name)
            .filter(|id| self.touch(id))
            .map(str::to_string);

        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.create();
                self.touch(&id);
                response.set_cookie(cookie_name, Cookie::new(id.clone()).path("/"))?;
                debug!("Started session {}", id);
                id
            }
        };

        let handle = SessionHandle {
            id,
            store: Arc::clone(self),
        };
        request.set_session(handle.clone());
        Ok(handle)
    }

    /// Start the background sweep, running every `interval` until the
    /// returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let store = Arc::clone(self);

        let thread = thread::Builder::new()
            .name("session-sweeper".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            // A failed pass must not end the sweeper
                            match panic::catch_unwind(AssertUnwindSafe(|| store.sweep())) {
                                Ok(0) => {}
                                Ok(removed) => debug!("Swept {} expired sessions", removed),
                                Err(_) => error!("Session sweep panicked; retrying next tick"),
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                info!("Session sweeper stopped");
            })?;

        Ok(SweeperHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the sweeper thread when stopped or dropped
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        // Disconnecting the channel wakes the select
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A request's view of its session
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    store: Arc<SessionStore>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Value for `key`; `None` also when the session is gone
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store
            .with_session(&self.id, |s| s.get(key).cloned())
            .flatten()
    }

    /// Store a value; returns false when the session is gone
    pub fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        self.store
            .with_session(&self.id, |s| {
                s.set(key, value);
            })
            .is_some()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store
            .with_session(&self.id, |s| s.remove(key))
            .flatten()
    }

    pub fn hits(&self) -> u64 {
        self.store
            .with_session(&self.id, |s| s.hits())
            .unwrap_or(0)
    }

    pub fn invalidate(&self) -> bool {
        self.store.invalidate(&self.id)
    }
}
