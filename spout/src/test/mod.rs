// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use crate::bus::{Bus, BusMessage};
use crate::config::Filesystem;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;


/// Generous bound for things that should happen quickly.
pub const LONG_WAIT: Duration = Duration::from_secs(5);

/// How long to watch for something that should NOT happen.
pub const SHORT_WAIT: Duration = Duration::from_millis(200);

/// Statistician interval for tests; the production default is seconds.
pub const TEST_STATS_INTERVAL: Duration = Duration::from_millis(100);

//
// InMemoryBus
//

/// A loss-free in-process [Bus] so stage tests run without a server.
/// Messages fan out to every subscriber of the exact subject.
#[derive(Default)]
pub struct InMemoryBus {
  subscriptions: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
}

impl InMemoryBus {
  #[must_use]
  pub fn new() -> std::sync::Arc<Self> {
    std::sync::Arc::new(Self::default())
  }
}

#[async_trait]
impl Bus for InMemoryBus {
  async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
    let targets: Vec<mpsc::Sender<BusMessage>> = {
      let mut subscriptions = self.subscriptions.lock();
      subscriptions.retain(|(_, tx)| !tx.is_closed());
      subscriptions
        .iter()
        .filter(|(s, _)| s == subject)
        .map(|(_, tx)| tx.clone())
        .collect()
    };
    for tx in targets {
      let message = BusMessage {
        subject: subject.to_string(),
        payload: payload.clone(),
      };
      let _ = tx.send(message).await;
    }
    Ok(())
  }

  async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
    let (tx, rx) = mpsc::channel(1024);
    self
      .subscriptions
      .lock()
      .push((subject.to_string(), tx));
    Ok(rx)
  }

  async fn flush(&self) -> anyhow::Result<()> {
    Ok(())
  }
}

/// Receive the next message or panic after [LONG_WAIT].
pub async fn recv_message(receiver: &mut mpsc::Receiver<BusMessage>) -> BusMessage {
  tokio::time::timeout(LONG_WAIT, receiver.recv())
    .await
    .expect("timed out waiting for a bus message")
    .expect("bus subscription closed")
}

/// Assert nothing arrives within [SHORT_WAIT].
pub async fn assert_no_message(receiver: &mut mpsc::Receiver<BusMessage>) {
  if let Ok(Some(message)) = tokio::time::timeout(SHORT_WAIT, receiver.recv()).await {
    panic!(
      "unexpected message on {}: {:?}",
      message.subject, message.payload
    );
  }
}

/// Keep reading monitor messages until `expected` shows up, panicking after
/// [LONG_WAIT]. Earlier snapshots with stale counters are skipped.
pub async fn wait_for_stats(receiver: &mut mpsc::Receiver<BusMessage>, expected: &str) {
  let mut last = String::new();
  let result = tokio::time::timeout(LONG_WAIT, async {
    loop {
      let Some(message) = receiver.recv().await else {
        break;
      };
      last = String::from_utf8_lossy(&message.payload).into_owned();
      if last == expected {
        break;
      }
    }
  })
  .await;
  assert!(
    result.is_ok(),
    "timed out waiting for stats {expected:?}; last seen {last:?}"
  );
}

//
// MemFilesystem
//

/// In-memory [Filesystem] for config loader tests.
#[derive(Default)]
pub struct MemFilesystem {
  files: Mutex<HashMap<String, String>>,
}

impl MemFilesystem {
  pub fn write(&self, path: &str, contents: &str) {
    self
      .files
      .lock()
      .insert(path.to_string(), contents.to_string());
  }
}

impl Filesystem for MemFilesystem {
  fn read_to_string(&self, path: &str) -> io::Result<String> {
    self.files.lock().get(path).cloned().ok_or_else(|| {
      io::Error::new(io::ErrorKind::NotFound, format!("{path}: file not found"))
    })
  }
}
