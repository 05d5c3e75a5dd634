use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::adapter::ChannelAdapter;

/// Registry of connected channel adapters, keyed by channel type.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        adapters.insert(adapter.channel_type().to_string(), adapter);
    }

    pub fn remove(&self, channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        adapters.remove(channel_type)
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters.get(channel_type).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        async_trait::async_trait,
        courier_common::types::OutgoingMessage,
    };

    use {
        super::*,
        crate::adapter::{AdapterStatus, EventSender},
    };

    struct NullAdapter;

    #[async_trait]
    impl ChannelAdapter for NullAdapter {
        fn channel_type(&self) -> &str {
            "null"
        }

        fn name(&self) -> &str {
            "Null"
        }

        async fn connect(&self, _events: EventSender) -> crate::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> crate::Result<()> {
            Ok(())
        }

        fn status(&self) -> AdapterStatus {
            AdapterStatus::Connected
        }

        async fn send_message(&self, _message: &OutgoingMessage) -> crate::Result<String> {
            Ok("1".into())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter));
        assert!(registry.get("null").is_some());
        assert!(registry.get("telegram").is_none());
        assert_eq!(registry.list(), vec!["null".to_string()]);

        registry.remove("null");
        assert!(registry.get("null").is_none());
    }

    #[tokio::test]
    async fn default_capabilities_are_off() {
        let adapter = NullAdapter;
        assert!(!adapter.supports_inline_keyboards());
        assert!(!adapter.supports_draft_stream());
        assert!(adapter.edit_message("c", "m", "t").await.is_err());
        assert!(adapter.answer_callback("cb", None).await.is_ok());
    }
}
