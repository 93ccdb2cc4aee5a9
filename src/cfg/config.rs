// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::engine::RequestParams;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Socket-pool parameters.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Default knobs applied to new requests.
    #[serde(default)]
    pub request: RequestDefaults,
}

/// Parameters of the dispatch layer.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DispatchConfig {
    /// UDP receive buffer size in bytes. Responses larger than this are
    /// truncated by the kernel, so keep it at the largest expected EDNS
    /// payload.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
    /// CIDR prefixes queries must never be sent to.
    #[serde(default)]
    pub blackhole: Vec<String>,
}

/// Defaults for the per-request knobs.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RequestDefaults {
    /// Overall deadline, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// UDP retransmission period, in milliseconds. Derived from the
    /// deadline and the retry count when absent.
    #[serde(default)]
    pub udp_timeout_ms: Option<u64>,
    /// UDP retransmissions after the initial send.
    #[serde(default)]
    pub udp_retries: u32,
}

fn default_recv_buffer() -> usize {
    4096
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            recv_buffer: default_recv_buffer(),
            blackhole: Vec::new(),
        }
    }
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            udp_timeout_ms: None,
            udp_retries: 0,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.dispatch.recv_buffer >= 512,
            "dispatch.recv_buffer must hold at least a 512-byte payload"
        );
        ensure!(
            self.request.timeout_ms > 0,
            "request.timeout_ms must be non-zero"
        );
        Ok(())
    }

    /// Request parameters seeded from the configured defaults.
    pub fn request_params(&self, destination: SocketAddr) -> RequestParams {
        let mut params = RequestParams::new(destination)
            .timeout(Duration::from_millis(self.request.timeout_ms))
            .udp_retries(self.request.udp_retries);
        if let Some(udp_timeout_ms) = self.request.udp_timeout_ms {
            params = params.udp_timeout(Duration::from_millis(udp_timeout_ms));
        }
        params
    }
}
