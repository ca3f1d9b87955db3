//! NATS event publisher
//!
//! Publishes serialized dispatch envelopes to NATS JetStream.

use crate::error::GatewayError;
use crate::events::serialize::GatewayEvent;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stream names
pub mod streams {
    /// Commands stream for interactions
    pub const COMMANDS: &str = "COMMANDS";
    /// Events stream for every other dispatch
    pub const EVENTS: &str = "EVENTS";
}

/// Subject prefixes for routing
pub mod subjects {
    /// Interactions: commands.interaction
    pub const INTERACTION: &str = "commands.interaction";
    /// Everything else: events.{event_type}
    pub const EVENTS: &str = "events";
}

/// Route event to appropriate subject based on event type
pub fn subject_for(event: &GatewayEvent) -> String {
    match event.event_type.as_str() {
        "interaction.create" => subjects::INTERACTION.to_string(),
        other => format!("{}.{other}", subjects::EVENTS),
    }
}

/// Publish totals since connect, as reported on `/ready`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub messages_published: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct PublishCounters {
    published: AtomicU64,
    failures: AtomicU64,
}

impl PublishCounters {
    fn record<T, E>(&self, outcome: &Result<T, E>) {
        let counter = match outcome {
            Ok(_) => &self.published,
            Err(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> PublishStats {
        PublishStats {
            messages_published: self.published.load(Ordering::Relaxed),
            publish_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// NATS publisher for gateway events
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    counters: PublishCounters,
}

impl NatsPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            counters: PublishCounters::default(),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    pub fn stats(&self) -> PublishStats {
        self.counters.stats()
    }

    pub fn jetstream(&self) -> &JsContext {
        &self.jetstream
    }

    /// Publish a gateway event to the appropriate stream
    pub async fn publish_event(&self, event: &GatewayEvent) -> Result<(), GatewayError> {
        let subject = subject_for(event);
        let payload = serde_json::to_vec(event).map_err(GatewayError::Encode)?;

        debug!(
            event_type = %event.event_type,
            subject,
            event_id = %event.event_id,
            "Publishing event"
        );

        let publish = async {
            self.jetstream
                .publish(subject.clone(), payload.into())
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        };

        let outcome = publish.await;
        self.counters.record(&outcome);
        match outcome {
            Ok(ack) => {
                debug!(
                    subject,
                    stream = %ack.stream,
                    seq = ack.sequence,
                    "Event published"
                );
                Ok(())
            }
            Err(source) => {
                warn!(subject, error = %source, "Failed to publish event");
                Err(GatewayError::NatsPublishFailed { subject, source })
            }
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

/// Ensure streams exist with correct configuration
///
/// Run once at startup; existing streams are left as they are.
pub async fn ensure_streams(js: &JsContext) -> Result<(), GatewayError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    let configs = [
        // Interactions expire quickly; a stale command is worse than none
        (streams::COMMANDS, "commands.>", Duration::from_secs(60)),
        (streams::EVENTS, "events.>", Duration::from_secs(300)),
    ];

    for (name, subject, max_age) in configs {
        let config = Config {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::Limits,
            max_age,
            storage: StorageType::Memory,
            ..Default::default()
        };

        match js.get_or_create_stream(config).await {
            Ok(_) => info!(stream = name, "NATS stream ready"),
            Err(e) => {
                error!(stream = name, error = %e, "Failed to create NATS stream");
                return Err(GatewayError::NatsConnectionFailed(Box::new(e)));
            }
        }
    }

    info!("NATS streams configured");
    Ok(())
}
