use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use tracing::debug;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::sync::lock;
use crate::transport::{Shared, Transport};

/// Shares one endpoint per local port between independent callers.
///
/// Entries are weak: the pool never keeps an endpoint open by itself. Once
/// every lease on a port is released the next `acquire` binds afresh.
#[derive(Debug)]
pub struct TransportPool {
    config: TransportConfig,
    entries: Mutex<HashMap<Option<u16>, Weak<Shared>>>,
}

impl TransportPool {
    /// Pool binding new endpoints with `config` (its port is overridden per call).
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Lease the endpoint for `port`, binding it if nobody holds it.
    ///
    /// `None` selects the shared client endpoint on an ephemeral port.
    pub fn acquire(&self, port: Option<u16>) -> Result<Transport> {
        let mut entries = lock(&self.entries);
        if let Some(shared) = entries.get(&port).and_then(Weak::upgrade) {
            if let Some(transport) = Transport::lease(&shared) {
                debug!(?port, local_addr = %transport.local_addr(), "reusing pooled endpoint");
                return Ok(transport);
            }
        }

        let mut config = self.config.clone();
        config.bind_addr.set_port(port.unwrap_or(0));
        let transport = Transport::bind(config)?;

        entries.retain(|_, shared| shared.strong_count() > 0);
        entries.insert(port, std::sync::Arc::downgrade(&transport.shared));
        Ok(transport)
    }

    /// Number of pooled endpoints that are still open.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter_map(Weak::upgrade)
            .filter(|shared| !lock(&shared.state).closed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransportPool {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}
