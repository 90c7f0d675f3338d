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

//! Component I: liveness reaper. Ticked from the main context's own event
//! loop (no dedicated thread) to remove sessions that have gone silent
//! without sending a SAP goodbye — a crashed sender or a lost network path
//! never announces that it stopped.

use crate::{config::DEATH_TIMEOUT, registry::SessionRegistry};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

fn now_unix_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Removes every session whose last RTP activity is older than
/// [`DEATH_TIMEOUT`], stopping each one's thread as it goes. Returns the
/// number of sessions removed, for logging at the call site.
pub fn sweep(registry: &mut SessionRegistry) -> usize {
    let now_sec = now_unix_sec();
    let stale = registry.iter_stale(now_sec, DEATH_TIMEOUT.as_secs() as u32);

    for origin_key in &stale {
        registry.remove(origin_key);
        info!("session '{origin_key}' reaped: no RTP activity for {DEATH_TIMEOUT:?}");
    }

    stale.len()
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
    fn sweep_leaves_fresh_sessions_alone() {
        let mut registry = SessionRegistry::new();
        registry.insert(fake_handle("fresh", now_unix_sec())).expect("insert");
        assert_eq!(sweep(&mut registry), 0);
        assert!(registry.contains("fresh"));
    }

    #[test]
    fn sweep_removes_sessions_past_the_death_timeout() {
        let mut registry = SessionRegistry::new();
        registry.insert(fake_handle("stale", 0)).expect("insert");
        assert_eq!(sweep(&mut registry), 1);
        assert!(!registry.contains("stale"));
    }

    #[test]
    fn sweep_is_idempotent_once_stale_sessions_are_gone() {
        let mut registry = SessionRegistry::new();
        registry.insert(fake_handle("stale", 0)).expect("insert");
        sweep(&mut registry);
        assert_eq!(sweep(&mut registry), 0);
    }
}
