/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Component G: the main context's table of live sessions, keyed by SDP
//! origin. Insertion order is kept alongside the map so discovery can be
//! deterministic about which session a log line refers to.

use crate::{config::MAX_SESSIONS, error::SessionError, session::SessionHandle};
use std::collections::HashMap;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionHandle>,
    order: Vec<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, origin_key: &str) -> bool {
        self.sessions.contains_key(origin_key)
    }

    pub fn get(&self, origin_key: &str) -> Option<&SessionHandle> {
        self.sessions.get(origin_key)
    }

    /// Registers a new session, rejecting the insert if the registry is
    /// already at [`MAX_SESSIONS`].
    pub fn insert(&mut self, handle: SessionHandle) -> Result<(), SessionError> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(SessionError::CapacityExceeded(MAX_SESSIONS));
        }
        let key = handle.origin_key.clone();
        self.order.push(key.clone());
        self.sessions.insert(key, handle);
        Ok(())
    }

    /// Removes a session by origin key, telling its thread to stop (the
    /// thread tears itself down asynchronously; this call does not block).
    pub fn remove(&mut self, origin_key: &str) -> Option<SessionHandle> {
        self.order.retain(|k| k != origin_key);
        let handle = self.sessions.remove(origin_key);
        if let Some(handle) = &handle {
            handle.stop();
        }
        handle
    }

    /// Origin keys of sessions whose last RTP activity is older than
    /// `death_timeout_sec` relative to `now_sec`.
    pub fn iter_stale(&self, now_sec: u32, death_timeout_sec: u32) -> Vec<String> {
        self.order
            .iter()
            .filter(|key| {
                self.sessions
                    .get(*key)
                    .map(|h| now_sec.saturating_sub(h.last_activity_sec()) >= death_timeout_sec)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;

    fn fake_handle(origin: &str, last_activity_sec: u32) -> SessionHandle {
        let group_addr = "239.1.1.1:6000".parse().expect("literal");
        SessionHandle::new_for_test(origin, group_addr, last_activity_sec)
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = SessionRegistry::new();
        for i in 0..MAX_SESSIONS {
            registry
                .insert(fake_handle(&format!("origin-{i}"), 0))
                .expect("should insert under capacity");
        }
        let err = registry.insert(fake_handle("one-too-many", 0)).unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded(MAX_SESSIONS)));
        assert_eq!(registry.len(), MAX_SESSIONS);
    }

    #[test]
    fn remove_drops_the_session() {
        let mut registry = SessionRegistry::new();
        registry.insert(fake_handle("a", 0)).expect("insert");
        assert!(registry.contains("a"));
        let removed = registry.remove("a");
        assert!(removed.is_some());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn iter_stale_finds_sessions_past_the_death_timeout() {
        let mut registry = SessionRegistry::new();
        registry.insert(fake_handle("fresh", 100)).expect("insert");
        registry.insert(fake_handle("stale", 10)).expect("insert");

        let stale = registry.iter_stale(100, 20);
        assert_eq!(stale, vec!["stale".to_owned()]);
    }
}
