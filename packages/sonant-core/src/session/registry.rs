//! Session and call registries.
//!
//! The session registry owns the keyed map of live sessions and the
//! stale-session sweep. The call registry holds call identifiers
//! announced by the carrier webhook (handled outside this crate) so the
//! media-stream handler can verify that a `start` frame refers to a call
//! we are expecting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::InferenceConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::session::Session;

/// Keyed storage and lifecycle authority for live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    max_queue: usize,
    /// Cancels the background sweep on shutdown.
    sweep_token: CancellationToken,
}

impl SessionRegistry {
    /// Creates a registry whose sessions use the given inbound queue bound.
    pub fn new(max_queue: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            max_queue,
            sweep_token: CancellationToken::new(),
        })
    }

    /// Creates and registers a session.
    ///
    /// Fails with `AlreadyExists` when the identifier is taken; carrier
    /// call identifiers are unique per call, so a duplicate means a
    /// protocol violation or a reconnect racing its own cleanup.
    pub fn create(
        &self,
        session_id: &str,
        inference: InferenceConfig,
    ) -> BridgeResult<Arc<Session>> {
        let session = Session::new(session_id, inference, self.max_queue);
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BridgeError::AlreadyExists(session_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                log::info!("[Registry] Session created: id={}", session_id);
                Ok(session)
            }
        }
    }

    /// Looks up a session by identifier.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|r| Arc::clone(r.value()))
    }

    /// Removes a session: completes its subject and signals and clears
    /// its handler map. Double-remove is a no-op.
    pub fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.close();
            session.clear_handlers();
            session.finish_closed();
            log::info!("[Registry] Session removed: id={}", session_id);
        }
    }

    /// Identifiers of all sessions still marked active.
    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|r| r.value().is_active())
            .map(|r| r.key().clone())
            .collect()
    }

    #[must_use]
    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|r| r.value().is_active())
            .unwrap_or(false)
    }

    /// Records activity on a session.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.touch();
        }
    }

    /// Flags a session for the next sweep without tearing it down now.
    pub fn mark_for_cleanup(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.mark_for_cleanup();
        }
    }

    /// Number of registered sessions (any state).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// One sweep pass: removes sessions idle beyond the timeout and
    /// sessions already marked for cleanup.
    pub fn sweep(&self, stale_timeout: Duration) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|r| r.value().is_marked_for_cleanup() || r.value().idle_for() >= stale_timeout)
            .map(|r| r.key().clone())
            .collect();
        for session_id in stale {
            log::info!("[Registry] Sweeping stale session: id={}", session_id);
            self.remove(&session_id);
        }
    }

    /// Spawns the periodic stale-session sweep. Not started under
    /// `cfg(test)`; tests call [`SessionRegistry::sweep`] directly.
    pub fn start_sweep(self: &Arc<Self>, stale_timeout_ms: u64) {
        if cfg!(test) {
            return;
        }
        let registry = Arc::clone(self);
        let token = self.sweep_token.clone();
        tokio::spawn(async move {
            let stale_timeout = Duration::from_millis(stale_timeout_ms);
            // Check at 1/10 the timeout, bounded to a sane band.
            let check_every = Duration::from_millis((stale_timeout_ms / 10).clamp(1_000, 60_000));
            let mut ticker = tokio::time::interval(check_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => registry.sweep(stale_timeout),
                }
            }
        });
    }

    /// Tears down every session and stops the sweep.
    pub fn shutdown(&self) {
        self.sweep_token.cancel();
        let ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for session_id in ids {
            self.remove(&session_id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Calls announced by the carrier webhook and not yet expired.
///
/// The webhook handler (outside this crate) registers a call before the
/// carrier opens the media stream; the `start` frame is only accepted
/// for a registered call.
pub struct CallRegistry {
    calls: DashMap<String, Instant>,
    ttl: Duration,
}

impl CallRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            ttl,
        }
    }

    /// Announces an incoming call.
    pub fn register(&self, call_sid: &str) {
        self.calls.insert(call_sid.to_string(), Instant::now());
    }

    /// Whether the call is known and unexpired.
    #[must_use]
    pub fn is_active(&self, call_sid: &str) -> bool {
        self.calls
            .get(call_sid)
            .map(|registered| registered.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Forgets a call.
    pub fn remove(&self, call_sid: &str) {
        self.calls.remove(call_sid);
    }

    /// Drops expired entries.
    pub fn expire(&self) {
        let ttl = self.ttl;
        self.calls.retain(|_, registered| registered.elapsed() < ttl);
    }
}
