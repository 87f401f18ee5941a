//! Component-wise health probes for operational tooling.

use std::sync::Arc;

use serde::Serialize;

use crate::connection::Connection;
use crate::outbox::OutboxStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.into(),
            status: ComponentStatus::Healthy,
            detail: None,
        }
    }

    fn degraded(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ComponentStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ComponentStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    fn from_components(components: Vec<ComponentHealth>) -> Self {
        let healthy = components
            .iter()
            .all(|c| c.status != ComponentStatus::Unhealthy);
        Self {
            healthy,
            components,
        }
    }
}

/// Probes the broker connection, the primary stream, and the outbox backlog.
pub struct HealthCheck {
    connection: Arc<Connection>,
    stream_name: String,
    outbox: Option<Arc<dyn OutboxStore>>,
}

impl HealthCheck {
    pub fn new(
        connection: Arc<Connection>,
        stream_name: impl Into<String>,
        outbox: Option<Arc<dyn OutboxStore>>,
    ) -> Self {
        Self {
            connection,
            stream_name: stream_name.into(),
            outbox,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let mut components = Vec::new();

        let handle = match self.connection.ensure().await {
            Ok(handle) => {
                components.push(ComponentHealth::healthy("connection"));
                Some(handle)
            }
            Err(err) => {
                components.push(ComponentHealth::unhealthy("connection", err.to_string()));
                None
            }
        };

        if let Some(handle) = &handle {
            match handle.jetstream.get_stream(&self.stream_name).await {
                Ok(mut stream) => match stream.info().await {
                    Ok(info) => {
                        components.push(ComponentHealth {
                            name: "stream".into(),
                            status: ComponentStatus::Healthy,
                            detail: Some(format!(
                                "{} messages, {} consumers",
                                info.state.messages, info.state.consumer_count
                            )),
                        });
                    }
                    Err(err) => {
                        components.push(ComponentHealth::degraded("stream", err.to_string()))
                    }
                },
                Err(err) => {
                    components.push(ComponentHealth::unhealthy(
                        "stream",
                        format!("{}: {err}", self.stream_name),
                    ));
                }
            }
        }

        if let Some(outbox) = &self.outbox {
            match outbox.stats().await {
                Ok(stats) if stats.failed > 0 => {
                    components.push(ComponentHealth::degraded(
                        "outbox",
                        format!("{} rows failed permanently", stats.failed),
                    ));
                }
                Ok(stats) => {
                    components.push(ComponentHealth {
                        name: "outbox".into(),
                        status: ComponentStatus::Healthy,
                        detail: Some(format!(
                            "{} pending, oldest {}s",
                            stats.pending, stats.oldest_pending_seconds
                        )),
                    });
                }
                Err(err) => {
                    components.push(ComponentHealth::unhealthy("outbox", err.to_string()));
                }
            }
        }

        HealthReport::from_components(components)
    }
}

/// Outcome of a probe without broker access, used by tests and by callers
/// aggregating their own component lists.
pub fn aggregate(components: Vec<ComponentHealth>) -> HealthReport {
    HealthReport::from_components(components)
}
