// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use serde::Deserialize;
use std::io;
use std::path::Path;

/// Parsed first when present; the file given on the command line is overlaid
/// on top of it.
pub const COMMON_FILE_NAME: &str = "/etc/spout.toml";

const DEFAULT_LISTENER_PORT: u16 = 10001;
const DEFAULT_HTTP_LISTENER_PORT: u16 = 13337;

//
// Filesystem
//

/// File access for the config loader, injected so tests can run against an
/// in-memory tree instead of a process-wide filesystem.
pub trait Filesystem: Send + Sync {
  fn read_to_string(&self, path: &str) -> io::Result<String>;
}

pub struct RealFilesystem {}

impl Filesystem for RealFilesystem {
  fn read_to_string(&self, path: &str) -> io::Result<String> {
    std::fs::read_to_string(path)
  }
}

//
// ConfigError
//

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("{path}: {source}")]
  Read { path: String, source: io::Error },
  #[error("{path}: {source}")]
  Parse {
    path: String,
    source: toml::de::Error,
  },
  #[error("mode not specified in config")]
  MissingMode,
}

//
// Mode
//

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  Listener,
  ListenerHttp,
  Filter,
  Writer,
}

//
// RawRule
//

/// One `[[rule]]` entry, in config order. Compiled into a
/// [crate::filter::rules::RuleSet] at filter startup.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RawRule {
  #[serde(rename = "type")]
  pub rule_type: String,
  #[serde(rename = "match")]
  pub pattern: String,
  pub subject: String,
}

//
// Config
//

/// The full configuration surface shared by every mode. A single file
/// configures a single-mode process; unrelated knobs keep their defaults.
#[derive(Clone, Debug)]
pub struct Config {
  pub name: String,
  pub mode: Mode,
  pub port: u16,
  pub nats_address: String,
  pub nats_subject: Vec<String>,
  pub nats_subject_monitor: String,
  pub nats_subject_junkyard: String,
  pub influxdb_address: String,
  pub influxdb_port: u16,
  pub influxdb_dbname: String,
  pub batch: usize,
  pub batch_max_mb: usize,
  pub batch_max_secs: u64,
  pub workers: usize,
  pub write_timeout_secs: u64,
  pub read_buffer_bytes: usize,
  pub nats_pending_max_mb: usize,
  pub listener_batch_bytes: usize,
  pub max_time_delta_secs: u64,
  pub debug: bool,
  pub rule: Vec<RawRule>,
}

// The deserialization target: everything optional or defaulted, finalized
// into [Config] once both layers have been merged.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
  name: Option<String>,
  mode: Option<Mode>,
  #[serde(default)]
  port: u16,
  #[serde(default = "default_nats_address")]
  nats_address: String,
  #[serde(default = "default_nats_subject")]
  nats_subject: Vec<String>,
  #[serde(default = "default_nats_subject_monitor")]
  nats_subject_monitor: String,
  #[serde(default = "default_nats_subject_junkyard")]
  nats_subject_junkyard: String,
  #[serde(default = "default_influxdb_address")]
  influxdb_address: String,
  #[serde(default = "default_influxdb_port")]
  influxdb_port: u16,
  #[serde(default = "default_influxdb_dbname")]
  influxdb_dbname: String,
  #[serde(default = "default_batch")]
  batch: usize,
  #[serde(default = "default_batch_max_mb")]
  batch_max_mb: usize,
  #[serde(default = "default_batch_max_secs")]
  batch_max_secs: u64,
  #[serde(default = "default_workers")]
  workers: usize,
  #[serde(default = "default_write_timeout_secs")]
  write_timeout_secs: u64,
  #[serde(default = "default_read_buffer_bytes")]
  read_buffer_bytes: usize,
  #[serde(default = "default_nats_pending_max_mb")]
  nats_pending_max_mb: usize,
  #[serde(default = "default_listener_batch_bytes")]
  listener_batch_bytes: usize,
  #[serde(default = "default_max_time_delta_secs")]
  max_time_delta_secs: u64,
  #[serde(default)]
  debug: bool,
  #[serde(default)]
  rule: Vec<RawRule>,
}

fn default_nats_address() -> String {
  "nats://localhost:4222".to_string()
}

fn default_nats_subject() -> Vec<String> {
  vec!["spout".to_string()]
}

fn default_nats_subject_monitor() -> String {
  "spout-monitor".to_string()
}

fn default_nats_subject_junkyard() -> String {
  "spout-junk".to_string()
}

fn default_influxdb_address() -> String {
  "localhost".to_string()
}

const fn default_influxdb_port() -> u16 {
  8086
}

fn default_influxdb_dbname() -> String {
  "spout-junk".to_string()
}

const fn default_batch() -> usize {
  10
}

const fn default_batch_max_mb() -> usize {
  10
}

const fn default_batch_max_secs() -> u64 {
  300
}

const fn default_workers() -> usize {
  8
}

const fn default_write_timeout_secs() -> u64 {
  30
}

const fn default_read_buffer_bytes() -> usize {
  4 * 1024 * 1024
}

const fn default_nats_pending_max_mb() -> usize {
  200
}

const fn default_listener_batch_bytes() -> usize {
  1024 * 1024
}

const fn default_max_time_delta_secs() -> u64 {
  600
}

/// Load the configuration for one process: the common file first (skipped
/// when absent), then `path` overlaid on top of it at the TOML table level.
pub fn load(fs: &dyn Filesystem, path: &str) -> Result<Config, ConfigError> {
  let mut merged: Option<toml::Table> = None;
  match fs.read_to_string(COMMON_FILE_NAME) {
    Ok(contents) => merged = Some(parse_table(COMMON_FILE_NAME, &contents)?),
    Err(e) if e.kind() == io::ErrorKind::NotFound => (),
    Err(source) => {
      return Err(ConfigError::Read {
        path: COMMON_FILE_NAME.to_string(),
        source,
      });
    },
  }

  let contents = fs.read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_string(),
    source,
  })?;
  let overlay = parse_table(path, &contents)?;
  let merged = match merged {
    Some(mut base) => {
      merge_tables(&mut base, overlay);
      base
    },
    None => overlay,
  };

  let raw: RawConfig =
    toml::Value::Table(merged)
      .try_into()
      .map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
      })?;
  finalize(raw, path)
}

fn parse_table(path: &str, contents: &str) -> Result<toml::Table, ConfigError> {
  toml::from_str(contents).map_err(|source| ConfigError::Parse {
    path: path.to_string(),
    source,
  })
}

// Overlay `overlay` onto `base`: tables merge recursively, everything else
// (scalars and arrays, rule lists included) replaces wholesale.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
  for (key, value) in overlay {
    match (base.get_mut(&key), value) {
      (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
        merge_tables(base_table, overlay_table);
      },
      (_, value) => {
        base.insert(key, value);
      },
    }
  }
}

fn finalize(raw: RawConfig, path: &str) -> Result<Config, ConfigError> {
  let mode = raw.mode.ok_or(ConfigError::MissingMode)?;
  let port = match (raw.port, mode) {
    (0, Mode::Listener) => DEFAULT_LISTENER_PORT,
    (0, Mode::ListenerHttp) => DEFAULT_HTTP_LISTENER_PORT,
    (port, _) => port,
  };
  let name = raw.name.unwrap_or_else(|| {
    Path::new(path)
      .file_stem()
      .map_or_else(|| "spout".to_string(), |s| s.to_string_lossy().into_owned())
  });

  Ok(Config {
    name,
    mode,
    port,
    nats_address: raw.nats_address,
    nats_subject: raw.nats_subject,
    nats_subject_monitor: raw.nats_subject_monitor,
    nats_subject_junkyard: raw.nats_subject_junkyard,
    influxdb_address: raw.influxdb_address,
    influxdb_port: raw.influxdb_port,
    influxdb_dbname: raw.influxdb_dbname,
    batch: raw.batch,
    batch_max_mb: raw.batch_max_mb,
    batch_max_secs: raw.batch_max_secs,
    workers: raw.workers,
    write_timeout_secs: raw.write_timeout_secs,
    read_buffer_bytes: raw.read_buffer_bytes,
    nats_pending_max_mb: raw.nats_pending_max_mb,
    listener_batch_bytes: raw.listener_batch_bytes,
    max_time_delta_secs: raw.max_time_delta_secs,
    debug: raw.debug,
    rule: raw.rule,
  })
}
