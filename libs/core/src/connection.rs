//! Single shared broker connection with bounded reconnect.

use async_nats::jetstream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ConnectSettings;
use crate::error::Error;

/// Cheap clone of the live connection: core client plus JetStream context.
#[derive(Clone)]
pub struct Handle {
    pub client: async_nats::Client,
    pub jetstream: jetstream::Context,
}

/// Owns the socket. Everything else borrows a [`Handle`].
///
/// `ensure()` is idempotent and safe under concurrent callers: the first one
/// dials, the rest reuse the same connection until [`Connection::disconnect`].
pub struct Connection {
    urls: Vec<String>,
    settings: ConnectSettings,
    inner: Mutex<Option<Handle>>,
}

impl Connection {
    pub fn new(urls: Vec<String>, settings: ConnectSettings) -> Self {
        Self {
            urls,
            settings,
            inner: Mutex::new(None),
        }
    }

    /// Returns the shared handle, dialing on first use.
    pub async fn ensure(&self) -> Result<Handle, Error> {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let wait = self.settings.reconnect_wait;
        let options = async_nats::ConnectOptions::new()
            .connection_timeout(self.settings.connect_timeout)
            .max_reconnects(Some(self.settings.max_reconnects))
            .reconnect_delay_callback(move |_attempt| wait)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("broker connected"),
                    async_nats::Event::Disconnected => warn!("broker disconnected"),
                    other => warn!(event = ?other, "broker connection event"),
                }
            });

        let addrs = self.urls.join(",");
        let client = options
            .connect(addrs.as_str())
            .await
            .map_err(|e| Error::connection(format!("connect to {addrs}: {e}")))?;
        let handle = Handle {
            jetstream: jetstream::new(client.clone()),
            client,
        };
        *guard = Some(handle.clone());
        info!(urls = %addrs, "broker connection established");
        Ok(handle)
    }

    /// Whether a live handle exists and reports a connected socket.
    pub async fn is_connected(&self) -> bool {
        let guard = self.inner.lock().await;
        matches!(
            guard.as_ref().map(|h| h.client.connection_state()),
            Some(async_nats::connection::State::Connected)
        )
    }

    /// Flushes pending protocol writes and drops the connection.
    ///
    /// A later `ensure()` dials again.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.take() {
            handle
                .client
                .flush()
                .await
                .map_err(|e| Error::connection(format!("flush on disconnect: {e}")))?;
            info!("broker connection closed");
        }
        Ok(())
    }
}
