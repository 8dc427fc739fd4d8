//! Churn: drop silent peers and periodically rotate one at random.

use rand::seq::SliceRandom;

use meshlink_core::DisconnectReason;

use crate::registry::SessionId;
use crate::service::OverlayService;

impl OverlayService {
    pub fn remove_old_peers(&mut self) {
        let now = self.now();
        let threshold = self.config.network.session_timeout();

        let silent: Vec<SessionId> = self
            .registry
            .active_peers()
            .filter(|p| now.saturating_duration_since(p.last_message_at) > threshold)
            .map(|p| p.session_id)
            .collect();
        for session in silent {
            self.disconnect_session(session, DisconnectReason::Timeout);
        }

        if now.saturating_duration_since(self.last_refresh) > self.config.network.refresh_interval() {
            self.last_refresh = now;
            if self.registry.count_active() > 1 {
                let ids = self.registry.active_ids();
                if let Some(peer) = ids.choose(&mut rand::thread_rng()) {
                    self.disconnect_peer(peer, DisconnectReason::Refresh);
                }
            }
        }
    }
}
