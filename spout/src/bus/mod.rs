// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

// Per-subscription buffer between the bus reader task and the consuming
// stage. Overflow pushes back on the reader, not the bus connection.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 1024;

// Sizing unit for translating the configured pending-bytes cap into the
// client's per-subscription message capacity.
const PENDING_SIZE_UNIT_BYTES: usize = 65536;

//
// BusMessage
//

#[derive(Clone, Debug)]
pub struct BusMessage {
  pub subject: String,
  pub payload: Bytes,
}

//
// Bus
//

/// The pub/sub capability every stage runs against: named subjects carrying
/// opaque byte payloads, publish side internally thread-safe. Stages never
/// see the concrete transport, which keeps them runnable against the
/// in-process bus in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bus: Send + Sync {
  /// Publish one payload to a subject. Failures are reported, not retried;
  /// callers decide whether to drop or surface.
  async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()>;

  /// Subscribe to a subject. Dropping the receiver tears the subscription
  /// down.
  async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>>;

  /// Flush any locally buffered publishes to the transport.
  async fn flush(&self) -> anyhow::Result<()>;
}

//
// NatsBus
//

/// The production [Bus]: a single NATS client connection shared by every
/// task of a stage.
pub struct NatsBus {
  client: async_nats::Client,
}

impl NatsBus {
  /// Connect to the NATS server at `address`. `pending_max_bytes` bounds how
  /// much data may queue per subscription before the server treats this
  /// connection as a slow consumer; the client expresses the bound in
  /// messages, so it is approximated with the largest expected message size.
  pub async fn connect(address: &str, pending_max_bytes: usize) -> anyhow::Result<Self> {
    let capacity = (pending_max_bytes / PENDING_SIZE_UNIT_BYTES).max(1);
    let client = async_nats::ConnectOptions::new()
      .subscription_capacity(capacity)
      .connect(address)
      .await?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Bus for NatsBus {
  async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
    self.client.publish(subject.to_string(), payload).await?;
    Ok(())
  }

  async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
    let mut subscriber = self.client.subscribe(subject.to_string()).await?;
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
    tokio::spawn(async move {
      while let Some(message) = subscriber.next().await {
        let message = BusMessage {
          subject: message.subject.to_string(),
          payload: message.payload,
        };
        if tx.send(message).await.is_err() {
          // Receiver dropped; dropping the subscriber unsubscribes.
          break;
        }
      }
    });
    Ok(rx)
  }

  async fn flush(&self) -> anyhow::Result<()> {
    self.client.flush().await?;
    Ok(())
  }
}
