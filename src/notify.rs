use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{ChangeNotice, TenantId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per tenant. Delivery is best-effort: a
/// receiver that falls more than `CHANNEL_CAPACITY` notices behind loses the
/// oldest ones and is expected to re-query.
pub struct NotifyHub {
    channels: DashMap<TenantId, broadcast::Sender<ChangeNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a tenant's notices. Creates the channel if needed.
    pub fn subscribe(&self, tenant_id: TenantId) -> broadcast::Receiver<ChangeNotice> {
        let sender = self
            .channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, tenant_id: TenantId, notice: &ChangeNotice) {
        if let Some(sender) = self.channels.get(&tenant_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a tenant's channel (tenant removed).
    pub fn remove(&self, tenant_id: &TenantId) {
        self.channels.remove(tenant_id);
    }
}

/// `tenant_<ulid>`.
pub fn channel_name(tenant_id: TenantId) -> String {
    format!("tenant_{tenant_id}")
}

pub fn parse_channel(channel: &str) -> Option<TenantId> {
    let id = channel.strip_prefix("tenant_")?;
    ulid::Ulid::from_string(id).ok()
}
