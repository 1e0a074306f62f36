use std::sync::Arc;

use arbor_store::types::ProviderRecord;

use crate::client::HttpChatClient;
use crate::provider::ChatClient;

/// Resolves a stored provider record to a usable chat client.
///
/// Injected into the gateway so tests can substitute scripted clients
/// without touching the network.
pub trait ClientRegistry: Send + Sync {
    fn client_for(&self, provider: &ProviderRecord) -> Arc<dyn ChatClient>;
}

/// Production registry: every provider gets an `HttpChatClient` sharing
/// one connection pool.
pub struct HttpClientRegistry {
    http: reqwest::Client,
}

impl HttpClientRegistry {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry for HttpClientRegistry {
    fn client_for(&self, provider: &ProviderRecord) -> Arc<dyn ChatClient> {
        Arc::new(HttpChatClient::new(self.http.clone(), provider))
    }
}
