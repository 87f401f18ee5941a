//! Process-wide convenience shim over one engine instance.
//!
//! Everything here is a thin forwarder; the engine itself stays an explicit
//! value and nothing registers behind the application's back.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Error;
use crate::publish::{PublishOptions, PublishResult};

static ENGINE: OnceCell<Arc<Engine>> = OnceCell::new();

/// Builds, starts, and installs the process-wide engine.
pub async fn setup(config: Config) -> Result<Arc<Engine>, Error> {
    let engine = Arc::new(Engine::builder(config).build()?);
    engine.start().await?;
    install(engine.clone())?;
    Ok(engine)
}

/// Installs an already-built engine as the process-wide instance.
pub fn install(engine: Arc<Engine>) -> Result<(), Error> {
    ENGINE
        .set(engine)
        .map_err(|_| Error::configuration("process-wide engine already installed"))
}

pub fn engine() -> Result<Arc<Engine>, Error> {
    ENGINE
        .get()
        .cloned()
        .ok_or_else(|| Error::configuration("no process-wide engine; call setup() first"))
}

/// `publish` on the process-wide engine.
pub async fn publish(
    topic: &str,
    message: Value,
    options: PublishOptions,
) -> Result<PublishResult, Error> {
    let engine = engine()?;
    let publisher = engine.publisher().await?;
    publisher.publish(topic, message, options).await
}
