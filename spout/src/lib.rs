// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

pub mod bus;
pub mod config;
pub mod filter;
pub mod listener;
pub mod protos;
mod stats;
pub mod test;
pub mod time;
pub mod writer;

use crate::bus::{Bus, NatsBus};
use crate::config::{Config, Mode};
use crate::listener::Listener;
use crate::listener::http::HttpListener;
use crate::time::RealTimeProvider;
use async_trait::async_trait;
use spout_common::bind_resolver::RealBindResolver;
use std::sync::Arc;
use std::time::Duration;

/// How often statisticians report in production; tests inject something
/// shorter.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(3);

//
// Stoppable
//

/// A running stage of any mode. Stop is idempotent and bounded.
#[async_trait]
pub trait Stoppable: Send + Sync {
  async fn stop(&self);
}

#[async_trait]
impl Stoppable for Listener {
  async fn stop(&self) {
    Self::stop(self).await;
  }
}

#[async_trait]
impl Stoppable for HttpListener {
  async fn stop(&self) {
    Self::stop(self).await;
  }
}

#[async_trait]
impl Stoppable for filter::Filter {
  async fn stop(&self) {
    Self::stop(self).await;
  }
}

#[async_trait]
impl Stoppable for writer::Writer {
  async fn stop(&self) {
    Self::stop(self).await;
  }
}

/// Connect to the bus and start the stage selected by `config.mode`.
pub async fn run(config: Config) -> anyhow::Result<Box<dyn Stoppable>> {
  let bus: Arc<dyn Bus> = Arc::new(
    NatsBus::connect(
      &config.nats_address,
      config.nats_pending_max_mb * 1024 * 1024,
    )
    .await?,
  );
  let bind_resolver = RealBindResolver {};

  Ok(match config.mode {
    Mode::Listener => Box::new(
      Listener::start(&config, bus, &bind_resolver, DEFAULT_STATS_INTERVAL).await?,
    ),
    Mode::ListenerHttp => Box::new(
      HttpListener::start(&config, bus, &bind_resolver, DEFAULT_STATS_INTERVAL).await?,
    ),
    Mode::Filter => Box::new(
      filter::start_filter(
        &config,
        bus,
        Arc::new(RealTimeProvider {}),
        DEFAULT_STATS_INTERVAL,
      )
      .await?,
    ),
    Mode::Writer => {
      Box::new(writer::start_writer(&config, bus, DEFAULT_STATS_INTERVAL).await?)
    },
  })
}
