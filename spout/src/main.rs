// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use anyhow::Context;
use clap::Parser;
use log::info;
use spout::config::RealFilesystem;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
struct Options {
  /// Path to the TOML configuration file; /etc/spout.toml is layered
  /// underneath it.
  #[arg(short = 'c', long = "config")]
  pub config: String,
}

fn main() -> anyhow::Result<()> {
  let opts = Options::parse();

  let config = spout::config::load(&RealFilesystem {}, &opts.config)
    .with_context(|| format!("can't load config file from {}", opts.config))?;
  env_logger::Builder::from_env(
    env_logger::Env::default()
      .default_filter_or(if config.debug { "debug" } else { "info" }),
  )
  .init();
  info!("spout loading config {} mode {:?}", opts.config, config.mode);

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .context("can't build runtime")?;

  runtime.block_on(async {
    let stage = spout::run(config).await?;

    // Trap ctrl+c and sigterm and perform a clean shutdown.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    select! {
      _ = sigint.recv() => info!("received sigint"),
      _ = sigterm.recv() => info!("received sigterm"),
    }

    stage.stop().await;
    info!("runtime terminated");
    Ok(())
  })
}
