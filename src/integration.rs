//! Optional permission-system integration.
//!
//! The engine never references a concrete permission system; it only talks
//! to the [`PermissionBridge`] capability. Hosts that run one pass a real
//! adapter at startup, everyone else gets the no-op default — the core code
//! path is identical either way.

use crate::auth::models::PlayerId;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Capability interface over an optional external permission system.
#[async_trait]
pub trait PermissionBridge: Send + Sync {
    /// Adapter name for diagnostics
    fn name(&self) -> &'static str;

    /// The player's primary permission group
    async fn primary_group(&self, player_id: PlayerId) -> String;

    /// Grant a permission that expires on its own
    async fn grant_temporary(&self, player_id: PlayerId, permission: &str, duration: Duration);
}

/// Default bridge used when no permission system is present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPermissionBridge;

#[async_trait]
impl PermissionBridge for NoopPermissionBridge {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn primary_group(&self, _player_id: PlayerId) -> String {
        "default".to_string()
    }

    async fn grant_temporary(&self, _player_id: PlayerId, _permission: &str, _duration: Duration) {}
}

/// Pick the detected adapter when the host found one, the no-op otherwise.
pub fn select_bridge(detected: Option<Arc<dyn PermissionBridge>>) -> Arc<dyn PermissionBridge> {
    match detected {
        Some(bridge) => {
            log::info!("permission bridge enabled: {}", bridge.name());
            bridge
        }
        None => {
            log::info!("no permission system detected; bridge disabled");
            Arc::new(NoopPermissionBridge)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn noop_bridge_answers_default_group() {
        let bridge = select_bridge(None);
        assert_eq!(bridge.name(), "none");
        assert_eq!(bridge.primary_group(Uuid::new_v4()).await, "default");
    }

    #[tokio::test]
    async fn detected_bridge_wins() {
        struct Fixed;
        #[async_trait]
        impl PermissionBridge for Fixed {
            fn name(&self) -> &'static str {
                "fixed"
            }
            async fn primary_group(&self, _player_id: PlayerId) -> String {
                "vip".to_string()
            }
            async fn grant_temporary(
                &self,
                _player_id: PlayerId,
                _permission: &str,
                _duration: Duration,
            ) {
            }
        }

        let bridge = select_bridge(Some(Arc::new(Fixed)));
        assert_eq!(bridge.name(), "fixed");
        assert_eq!(bridge.primary_group(Uuid::new_v4()).await, "vip");
    }
}
