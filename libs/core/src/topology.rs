//! Idempotent stream provisioning.

use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType},
};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Error;
use crate::subject;

/// Names and subjects the rest of the runtime binds to after provisioning.
#[derive(Debug, Clone)]
pub struct Topology {
    pub stream: String,
    pub events_filter: String,
    pub dlq_subject: Option<String>,
    /// Present only when the DLQ subject needed its own stream.
    pub dlq_stream: Option<String>,
}

/// Creates the primary stream (and a DLQ stream when required) if absent.
///
/// An existing stream with a superset-compatible configuration is left
/// untouched; an incompatible one is reported as [`Error::Topology`] rather
/// than silently modified. Racing creators are fine: the loser swallows the
/// broker's answer and re-reads the winner's stream.
pub async fn ensure_topology(js: &jetstream::Context, config: &Config) -> Result<Topology, Error> {
    let events_filter = config.events_filter();
    let primary_subjects = vec![events_filter.clone()];

    let dlq_subject = config.use_dlq.then(|| config.dlq_subject());
    // JetStream refuses overlapping subjects across streams. The default DLQ
    // subject sits inside the events capture and rides the primary stream; a
    // dedicated DLQ stream exists only when the subject escapes the capture.
    let dlq_needs_stream = dlq_subject
        .as_deref()
        .map(|s| !subject::filter_matches(&events_filter, s))
        .unwrap_or(false);

    ensure_stream(
        js,
        config,
        &config.stream_name(),
        primary_subjects,
        "courier events",
    )
    .await?;

    let mut dlq_stream = None;
    if dlq_needs_stream {
        let name = config.dlq_stream_name();
        ensure_stream(
            js,
            config,
            &name,
            vec![dlq_subject.clone().unwrap_or_default()],
            "courier dead letters",
        )
        .await?;
        dlq_stream = Some(name);
    }

    Ok(Topology {
        stream: config.stream_name(),
        events_filter,
        dlq_subject,
        dlq_stream,
    })
}

async fn ensure_stream(
    js: &jetstream::Context,
    config: &Config,
    name: &str,
    subjects: Vec<String>,
    description: &str,
) -> Result<(), Error> {
    let wanted = StreamConfig {
        name: name.to_string(),
        subjects: subjects.clone(),
        retention: RetentionPolicy::Limits,
        max_age: config.max_age,
        storage: StorageType::File,
        num_replicas: config.replicas,
        discard: DiscardPolicy::Old,
        duplicate_window: config.duplicate_window,
        description: Some(description.to_string()),
        ..StreamConfig::default()
    };

    match js.get_stream(name).await {
        Ok(stream) => {
            check_compatible(name, &stream.cached_info().config, &subjects)?;
            debug!(stream = %name, "stream already provisioned");
            Ok(())
        }
        Err(_) => match js.create_stream(wanted).await {
            Ok(_) => {
                info!(stream = %name, subjects = ?subjects, "stream created");
                Ok(())
            }
            // Lost a creation race or the server rejected the config; either
            // way the surviving stream decides.
            Err(create_err) => match js.get_stream(name).await {
                Ok(stream) => {
                    check_compatible(name, &stream.cached_info().config, &subjects)?;
                    debug!(stream = %name, "stream created by concurrent caller");
                    Ok(())
                }
                Err(_) => Err(Error::topology(format!(
                    "create stream {name}: {create_err}"
                ))),
            },
        },
    }
}

/// An existing stream is compatible when its retention is limits-based and
/// its subject set covers every subject we need.
fn check_compatible(name: &str, existing: &StreamConfig, wanted: &[String]) -> Result<(), Error> {
    if existing.retention != RetentionPolicy::Limits {
        return Err(Error::topology(format!(
            "stream {name} has retention {:?}, expected limits",
            existing.retention
        )));
    }
    for subject in wanted {
        if !existing.subjects.iter().any(|s| covers(s, subject)) {
            return Err(Error::topology(format!(
                "stream {name} does not capture {subject:?} (subjects: {:?})",
                existing.subjects
            )));
        }
    }
    Ok(())
}

fn covers(existing: &str, wanted: &str) -> bool {
    existing == wanted || subject::filter_matches(existing, wanted)
}
