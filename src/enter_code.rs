use crate::registry::{ClientId, DisconnectObserver};
use dashmap::DashMap;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;

struct PendingCode {
    client_id: ClientId,
    issued_at: Instant,
}

/// One-time codes that let a client prove, over the data channel, which
/// control-channel identity it belongs to. A client holds at most one live
/// code; issuing a new one revokes the old.
pub struct EnterCodes {
    pending: DashMap<String, PendingCode>,
    by_client: DashMap<ClientId, String>,
    ttl: Duration,
}

impl EnterCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            by_client: DashMap::new(),
            ttl,
        }
    }

    pub fn issue(&self, client_id: &str) -> String {
        self.purge_expired(Instant::now());
        let code = loop {
            let candidate = generate_code();
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        self.pending.insert(
            code.clone(),
            PendingCode {
                client_id: client_id.to_string(),
                issued_at: Instant::now(),
            },
        );
        if let Some(replaced) = self.by_client.insert(client_id.to_string(), code.clone()) {
            self.pending.remove(&replaced);
        }
        debug!(
            "Issued enter code for client {} ({} pending)",
            client_id,
            self.len()
        );
        code
    }

    /// Exchanges a code for its client. A code works once and only within
    /// its lifetime.
    pub fn redeem(&self, code: &str) -> Option<ClientId> {
        self.redeem_at(code, Instant::now())
    }

    fn redeem_at(&self, code: &str, now: Instant) -> Option<ClientId> {
        let (_, pending) = self.pending.remove(code)?;
        self.by_client
            .remove_if(&pending.client_id, |_, current| current == code);

        if now.saturating_duration_since(pending.issued_at) > self.ttl {
            debug!("Enter code for client {} expired", pending.client_id);
            return None;
        }
        Some(pending.client_id)
    }

    pub fn revoke(&self, client_id: &str) {
        if let Some((_, code)) = self.by_client.remove(client_id) {
            self.pending.remove(&code);
        }
    }

    /// Drops codes nobody redeemed in time.
    fn purge_expired(&self, now: Instant) {
        let ttl = self.ttl;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.issued_at) <= ttl);
        self.by_client
            .retain(|_, code| self.pending.contains_key(code.as_str()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

impl DisconnectObserver for EnterCodes {
    fn on_client_disconnect(&self, client_id: &str) {
        self.revoke(client_id);
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_CHARSET[rng.random_range(0..CODE_CHARSET.len())] as char)
        .collect()
}
