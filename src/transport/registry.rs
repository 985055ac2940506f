use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ListenError;
use crate::transport::tls::TlsSettings;
use crate::transport::uds::UdsSettings;
use crate::transport::{ConnHandler, TransportListener};

/// Everything a transport needs to come up: which protocol to instantiate,
/// its protocol-specific settings, and optional TLS material. Snapshot taken
/// at construction time, immutable afterwards.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub protocol: String,
    pub uds: UdsSettings,
    pub tls: Option<TlsSettings>,
}

type ListenFuture = Pin<Box<dyn Future<Output = Result<Box<dyn TransportListener>, ListenError>> + Send>>;

/// Constructor for one transport: settings plus handler in, running listener
/// out.
pub type ListenFn = fn(StreamSettings, Arc<dyn ConnHandler>) -> ListenFuture;

/// Maps a protocol name to its listener constructor. Populated explicitly
/// during application wiring; nothing registers itself behind the caller's
/// back.
pub struct TransportRegistry {
    listeners: BTreeMap<String, ListenFn>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            listeners: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, protocol: &str, listen: ListenFn) -> Result<(), ListenError> {
        if self.listeners.contains_key(protocol) {
            return Err(ListenError::Registration(format!(
                "transport '{}' is already registered",
                protocol
            )));
        }
        self.listeners.insert(protocol.to_owned(), listen);
        Ok(())
    }

    pub async fn listen(
        &self,
        settings: StreamSettings,
        handler: Arc<dyn ConnHandler>,
    ) -> Result<Box<dyn TransportListener>, ListenError> {
        let Some(listen) = self.listeners.get(settings.protocol.as_str()) else {
            return Err(ListenError::Registration(format!(
                "no transport registered for '{}'",
                settings.protocol
            )));
        };
        listen(settings, handler).await
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers every transport this crate ships. Called once during startup;
/// a failure here is fatal to the process, not to any single listener.
pub fn register_builtin(registry: &mut TransportRegistry) -> Result<(), ListenError> {
    registry.register(crate::transport::uds::PROTOCOL_NAME, crate::transport::uds::listen_uds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = TransportRegistry::new();
        register_builtin(&mut registry).expect("first registration");
        assert!(register_builtin(&mut registry).is_err());
    }
}
