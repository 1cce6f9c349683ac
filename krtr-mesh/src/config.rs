//! Mesh configuration surface (§6) and the power-mode table (§4.7).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerMode {
    Performance,
    Balanced,
    PowerSaver,
    UltraLowPower,
}

impl Default for PowerMode {
    fn default() -> Self {
        PowerMode::Balanced
    }
}

/// One row of the power-mode table.
#[derive(Debug, Clone, Copy)]
pub struct PowerModeProfile {
    pub cover_traffic_default: bool,
    pub jitter_enabled: bool,
    pub min_delay_millis: u64,
    pub max_delay_millis: u64,
    pub cover_interval: Option<(u64, u64)>,
    pub max_connections: usize,
    pub max_fragment_size: usize,
    pub compression_threshold: usize,
    pub active_scan_duration: Duration,
    pub scan_pause_duration: Duration,
}

impl PowerMode {
    pub fn profile(self) -> PowerModeProfile {
        match self {
            PowerMode::Performance => PowerModeProfile {
                cover_traffic_default: true,
                jitter_enabled: true,
                min_delay_millis: 50,
                max_delay_millis: 500,
                cover_interval: Some((30_000, 120_000)),
                max_connections: 20,
                max_fragment_size: 500,
                compression_threshold: 100,
                active_scan_duration: Duration::from_secs(5),
                scan_pause_duration: Duration::from_secs(10),
            },
            PowerMode::Balanced => PowerModeProfile {
                cover_traffic_default: true,
                jitter_enabled: true,
                min_delay_millis: 100,
                max_delay_millis: 750,
                cover_interval: Some((60_000, 180_000)),
                max_connections: 10,
                max_fragment_size: 500,
                compression_threshold: 100,
                active_scan_duration: Duration::from_secs(7),
                scan_pause_duration: Duration::from_secs(14),
            },
            PowerMode::PowerSaver => PowerModeProfile {
                cover_traffic_default: false,
                jitter_enabled: true,
                min_delay_millis: 200,
                max_delay_millis: 1_000,
                cover_interval: None,
                max_connections: 5,
                max_fragment_size: 400,
                compression_threshold: 50,
                active_scan_duration: Duration::from_secs(10),
                scan_pause_duration: Duration::from_secs(25),
            },
            PowerMode::UltraLowPower => PowerModeProfile {
                cover_traffic_default: false,
                jitter_enabled: false,
                min_delay_millis: 0,
                max_delay_millis: 0,
                cover_interval: None,
                max_connections: 2,
                max_fragment_size: 300,
                compression_threshold: 50,
                active_scan_duration: Duration::from_secs(15),
                scan_pause_duration: Duration::from_secs(45),
            },
        }
    }
}

/// Adaptive TTL schedule (§4.9), keyed on estimated network size.
pub fn adaptive_ttl(estimated_peers: usize) -> u8 {
    match estimated_peers {
        0..=20 => 6,
        21..=50 => 5,
        51..=100 => 4,
        _ => 3,
    }
}

pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(43_200);
pub const DEFAULT_ROTATION_INTERVAL_MIN: Duration = Duration::from_secs(3_600);
pub const HANDSHAKE_PENDING_DEADLINE: Duration = Duration::from_secs(10);

/// The small config object exposed to the host (§6): power mode plus the
/// overrides a caller may apply on top of its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    pub power_mode: PowerMode,
    pub cover_traffic_enabled: Option<bool>,
    pub max_connections: Option<usize>,
    pub fragment_size: Option<usize>,
    pub store_ttl_secs: Option<u64>,
    pub rotation_interval_secs: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            power_mode: PowerMode::default(),
            cover_traffic_enabled: None,
            max_connections: None,
            fragment_size: None,
            store_ttl_secs: None,
            rotation_interval_secs: None,
        }
    }
}

impl MeshConfig {
    pub fn cover_traffic_enabled(&self) -> bool {
        self.cover_traffic_enabled
            .unwrap_or_else(|| self.power_mode.profile().cover_traffic_default)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or_else(|| self.power_mode.profile().max_connections)
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size.unwrap_or_else(|| self.power_mode.profile().max_fragment_size)
    }

    pub fn store_ttl(&self) -> Duration {
        self.store_ttl_secs.map(Duration::from_secs).unwrap_or(DEFAULT_STORE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ultra_low_power_disables_cover_and_jitter() {
        let profile = PowerMode::UltraLowPower.profile();
        assert!(!profile.cover_traffic_default);
        assert!(!profile.jitter_enabled);
        assert_eq!(profile.min_delay_millis, 0);
        assert_eq!(profile.max_delay_millis, 0);
    }

    #[test]
    fn adaptive_ttl_follows_table_boundaries() {
        assert_eq!(adaptive_ttl(20), 6);
        assert_eq!(adaptive_ttl(21), 5);
        assert_eq!(adaptive_ttl(100), 4);
        assert_eq!(adaptive_ttl(101), 3);
    }

    #[test]
    fn config_override_takes_precedence_over_power_mode_default() {
        let mut config = MeshConfig {
            power_mode: PowerMode::Performance,
            ..Default::default()
        };
        assert!(config.cover_traffic_enabled());
        config.cover_traffic_enabled = Some(false);
        assert!(!config.cover_traffic_enabled());
    }
}
