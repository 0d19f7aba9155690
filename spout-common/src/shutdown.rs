// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./shutdown_test.rs"]
mod shutdown_test;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

//
// ComponentShutdownTrigger
//

/// Owns the shutdown sequence for one stage. Every task spawned by the stage
/// holds a [ComponentShutdown] made from this trigger (directly or via a
/// [ComponentShutdownTriggerHandle]); `shutdown()` cancels them all and then
/// waits until every outstanding [ComponentShutdown] has been dropped.
pub struct ComponentShutdownTrigger {
  token: CancellationToken,
  completion_tx: mpsc::Sender<()>,
  completion_rx: mpsc::Receiver<()>,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    let (completion_tx, completion_rx) = mpsc::channel(1);
    Self {
      token: CancellationToken::new(),
      completion_tx,
      completion_rx,
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_handle(&self) -> ComponentShutdownTriggerHandle {
    ComponentShutdownTriggerHandle {
      token: self.token.clone(),
      completion_tx: self.completion_tx.clone(),
    }
  }

  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      token: self.token.clone(),
      _completion: self.completion_tx.clone(),
    }
  }

  /// Cancel all associated [ComponentShutdown] instances and wait for each to
  /// drop. Tasks are expected to observe `cancelled()`, finish their current
  /// unit of work, and drop their [ComponentShutdown] on exit.
  pub async fn shutdown(self) {
    self.token.cancel();
    let Self {
      completion_tx,
      mut completion_rx,
      ..
    } = self;
    drop(completion_tx);
    // recv() resolves with None once the last sender clone is gone.
    let _ = completion_rx.recv().await;
  }
}

//
// ComponentShutdownTriggerHandle
//

/// A cloneable handle that can mint further [ComponentShutdown] instances
/// after the trigger has been handed off.
#[derive(Clone)]
pub struct ComponentShutdownTriggerHandle {
  token: CancellationToken,
  completion_tx: mpsc::Sender<()>,
}

impl ComponentShutdownTriggerHandle {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      token: self.token.clone(),
      _completion: self.completion_tx.clone(),
    }
  }
}

//
// ComponentShutdown
//

/// Held by a task for its lifetime. Await `cancelled()` in select loops; the
/// embedded sender clone reports task exit to the trigger on drop.
#[derive(Clone)]
pub struct ComponentShutdown {
  token: CancellationToken,
  _completion: mpsc::Sender<()>,
}

impl ComponentShutdown {
  pub async fn cancelled(&self) {
    self.token.cancelled().await;
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }
}
