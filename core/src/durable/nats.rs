//! JetStream transport over `async-nats`.
//!
//! Each [`DurableTransport::connect`] opens its own client. A client that
//! loses its server is reported through [`DurableConnection::closed`] and the
//! durable bus replaces it; durable consumers live on the server and are
//! rebound by name.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, Consumer, DeliverPolicy},
    AckKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use super::transport::{
    ConnectOptions, ConnectionError, ConsumerConfig, DeliveredMessage, DurableConnection,
    DurableTransport, PubAck, PullConsumer, SubscriptionError,
};
use super::DurableConfig;

/// Connects to a NATS server and works on the stream that captures the
/// navigation subject, creating it on first use.
#[derive(Debug, Clone)]
pub struct NatsTransport {
    stream: String,
    subject: String,
}

impl NatsTransport {
    pub fn new(stream: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            subject: subject.into(),
        }
    }

    pub fn from_config(config: &DurableConfig) -> Self {
        Self::new(&config.stream, &config.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Open,
    Closed,
    Lost(String),
}

#[async_trait]
impl DurableTransport for NatsTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn DurableConnection>, ConnectionError> {
        let (link, _) = watch::channel(Link::Open);
        let link = Arc::new(link);
        let events = link.clone();

        let client = async_nats::ConnectOptions::new()
            .name(&options.name)
            .event_callback(move |event| {
                let link = events.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            link.send_if_modified(|state| {
                                if *state == Link::Open {
                                    *state = Link::Lost("disconnected from server".to_string());
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        other => debug!(target: "durable", event = ?other, "NATS event"),
                    }
                }
            })
            .connect(options.server.as_str())
            .await
            .map_err(|e| ConnectionError::Unreachable {
                server: options.server.clone(),
                reason: e.to_string(),
            })?;

        info!(target: "durable", server = %options.server, stream = %self.stream, "NATS connection established");
        Ok(Arc::new(NatsConnection {
            jetstream: jetstream::new(client.clone()),
            client,
            stream_name: self.stream.clone(),
            subject: self.subject.clone(),
            stream: OnceCell::new(),
            link,
        }))
    }
}

struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_name: String,
    subject: String,
    stream: OnceCell<jetstream::stream::Stream>,
    link: Arc<watch::Sender<Link>>,
}

impl NatsConnection {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match &*self.link.borrow() {
            Link::Open => Ok(()),
            Link::Closed => Err(ConnectionError::Closed("closed by client".into())),
            Link::Lost(reason) => Err(ConnectionError::Closed(reason.clone())),
        }
    }

    async fn stream(&self) -> Result<&jetstream::stream::Stream, SubscriptionError> {
        self.ensure_open()?;
        self.stream
            .get_or_try_init(|| async {
                self.jetstream
                    .get_or_create_stream(jetstream::stream::Config {
                        name: self.stream_name.clone(),
                        subjects: vec![self.subject.clone()],
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        SubscriptionError::Fetch(format!("stream {}: {}", self.stream_name, e))
                    })
            })
            .await
    }

    fn consumer(&self, name: &str, consumer: Consumer<pull::Config>) -> Arc<dyn PullConsumer> {
        Arc::new(NatsConsumer {
            name: name.to_string(),
            stream_name: self.stream_name.clone(),
            jetstream: self.jetstream.clone(),
            consumer,
            pending: DashMap::new(),
        })
    }
}

// Unlimited redelivery is 0 on our side and -1 on the server.
fn pull_config(config: &ConsumerConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(config.durable_name.clone()),
        filter_subject: config.filter_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::New,
        max_deliver: match config.max_deliver {
            0 => -1,
            n => i64::from(n),
        },
        ack_wait: config.ack_wait,
        ..Default::default()
    }
}

#[async_trait]
impl DurableConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, ConnectionError> {
        self.ensure_open()?;
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| ConnectionError::Publish(e.to_string()))?
            .await
            .map_err(|e| ConnectionError::Publish(e.to_string()))?;
        Ok(PubAck {
            stream: ack.stream,
            seq: ack.sequence,
        })
    }

    async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn PullConsumer>, SubscriptionError> {
        let stream = self.stream().await?;
        let consumer = stream
            .create_consumer(pull_config(&config))
            .await
            .map_err(|e| SubscriptionError::ConsumerCreate {
                name: config.durable_name.clone(),
                reason: e.to_string(),
            })?;
        debug!(target: "durable", consumer = %config.durable_name, "JetStream consumer created");
        Ok(self.consumer(&config.durable_name, consumer))
    }

    async fn bind_consumer(&self, name: &str) -> Result<Arc<dyn PullConsumer>, SubscriptionError> {
        let stream = self.stream().await?;
        let consumer = stream
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|e| {
                debug!(target: "durable", consumer = name, error = %e, "Consumer lookup failed");
                SubscriptionError::ConsumerNotFound(name.to_string())
            })?;
        Ok(self.consumer(name, consumer))
    }

    fn is_closed(&self) -> bool {
        *self.link.borrow() != Link::Open
    }

    async fn closed(&self) -> Option<ConnectionError> {
        let mut rx = self.link.subscribe();
        let state = match rx.wait_for(|s| *s != Link::Open).await {
            Ok(state) => (*state).clone(),
            Err(_) => Link::Closed,
        };
        match state {
            Link::Lost(reason) => Some(ConnectionError::Closed(reason)),
            _ => None,
        }
    }

    async fn close(&self) {
        let was_open = self.link.send_if_modified(|state| {
            if *state == Link::Open {
                *state = Link::Closed;
                true
            } else {
                false
            }
        });
        // The socket itself goes away with the last client handle.
        if was_open {
            if let Err(e) = self.client.flush().await {
                warn!(target: "durable", error = %e, "Flush on close failed");
            }
        }
    }
}

struct NatsConsumer {
    name: String,
    stream_name: String,
    jetstream: jetstream::Context,
    consumer: Consumer<pull::Config>,
    // Delivered but not yet settled, by stream sequence.
    pending: DashMap<u64, jetstream::Message>,
}

impl NatsConsumer {
    async fn settle(&self, seq: u64, kind: AckKind) -> Result<(), SubscriptionError> {
        let (_, message) = self.pending.remove(&seq).ok_or_else(|| SubscriptionError::Ack {
            seq,
            reason: "no pending delivery".to_string(),
        })?;
        message
            .ack_with(kind)
            .await
            .map_err(|e| SubscriptionError::Ack {
                seq,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl PullConsumer for NatsConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<DeliveredMessage>, SubscriptionError> {
        let mut messages = Box::pin(
            self.consumer
                .batch()
                .max_messages(batch)
                .expires(expires)
                .messages()
                .await
                .map_err(|e| SubscriptionError::Fetch(e.to_string()))?,
        );

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| SubscriptionError::Fetch(e.to_string()))?;
            let (stream_seq, delivered) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered),
                Err(e) => {
                    warn!(target: "durable", consumer = %self.name, error = %e, "Message without JetStream metadata");
                    continue;
                }
            };
            out.push(DeliveredMessage {
                subject: message.message.subject.to_string(),
                payload: message.message.payload.clone(),
                stream_seq,
                delivery_count: u32::try_from(delivered).unwrap_or(u32::MAX),
            });
            self.pending.insert(stream_seq, message);
        }
        Ok(out)
    }

    async fn ack(&self, seq: u64) -> Result<(), SubscriptionError> {
        self.settle(seq, AckKind::Ack).await
    }

    async fn nak(&self, seq: u64) -> Result<(), SubscriptionError> {
        self.settle(seq, AckKind::Nak(None)).await
    }

    async fn term(&self, seq: u64) -> Result<(), SubscriptionError> {
        self.settle(seq, AckKind::Term).await
    }

    async fn destroy(&self) -> Result<(), SubscriptionError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| SubscriptionError::Fetch(format!("stream {}: {}", self.stream_name, e)))?;
        stream.delete_consumer(&self.name).await.map_err(|e| {
            debug!(target: "durable", consumer = %self.name, error = %e, "Consumer delete failed");
            SubscriptionError::ConsumerNotFound(self.name.clone())
        })?;
        self.pending.clear();
        debug!(target: "durable", consumer = %self.name, "JetStream consumer deleted");
        Ok(())
    }
}
