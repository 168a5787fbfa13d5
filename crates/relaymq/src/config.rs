// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Client engine configuration.
//!
//! Defaults match the broker protocol's documented client defaults: 30 s
//! keep-alive ping, 100-message connection flow chunk, 1000-message
//! connection watermark, 100-message consumer prefetch with a 50% resume
//! threshold, 3 s recovery delay with a budget of 100 attempts.

use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for a single connection and everything it owns.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Keep-alive ping interval for the flow dispatcher's idle timer.
    pub ping_interval: Duration,

    /// Whether connection-scoped watermark checking is enabled.
    pub connection_flow_enabled: bool,
    /// Grant size for connection-scoped resume signals.
    pub flow_chunk_size: u32,
    /// Connection-scoped watermark (in-flight count at/below which resume
    /// becomes eligible).
    pub flow_water_mark: u32,

    /// Default consumer prefetch ceiling (0 = unbounded).
    pub prefetch_max: u32,
    /// Consumer resume threshold as a percentage of `prefetch_max`.
    pub prefetch_threshold_percent: u8,

    /// Delay before a recovery attempt touches the transport (HA brokers
    /// need time to elect a takeover peer).
    pub recover_delay: Duration,
    /// Recovery attempts before the coordinator aborts permanently.
    /// `None` retries forever.
    pub max_recover_retries: Option<u32>,

    /// Budget for synchronous broker round trips. Zero waits forever.
    pub ack_timeout: Duration,

    /// Reader idle wake interval (drives delayed-ack flushes and
    /// late-listener delivery between messages).
    pub reader_idle_interval: Duration,

    /// Connected to a highly-available broker pair. Enables the three-phase
    /// commit path and the request resend policy.
    pub ha: bool,

    /// Allow sessions with registered listeners (and connection-consumers)
    /// to survive recovery. Disabling restores the strict legacy behavior
    /// where recovery is rejected for such connections on non-HA brokers.
    pub enable_listener_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            connection_flow_enabled: true,
            flow_chunk_size: 100,
            flow_water_mark: 1000,
            prefetch_max: 100,
            prefetch_threshold_percent: 50,
            recover_delay: Duration::from_secs(3),
            max_recover_retries: Some(100),
            ack_timeout: Duration::ZERO,
            reader_idle_interval: Duration::from_secs(2),
            ha: false,
            enable_listener_reconnect: true,
        }
    }
}

impl ClientConfig {
    /// Validate cross-field consistency. Called once at connection setup.
    pub fn validate(&self) -> Result<()> {
        if self.prefetch_threshold_percent > 100 {
            return Err(Error::InvalidConfig(format!(
                "prefetch_threshold_percent must be 0-100, got {}",
                self.prefetch_threshold_percent
            )));
        }
        if self.connection_flow_enabled && self.flow_chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "flow_chunk_size must be non-zero when connection flow control is enabled".into(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::InvalidConfig("ping_interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_bad_threshold() {
        let cfg = ClientConfig {
            prefetch_threshold_percent: 101,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_chunk_when_enabled() {
        let cfg = ClientConfig {
            flow_chunk_size: 0,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
