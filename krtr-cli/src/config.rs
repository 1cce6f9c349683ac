//! Host-level persisted config: CLI argument defaults plus a saved nickname,
//! layered underneath the `krtr_mesh::MeshConfig` the engine actually reads.

use krtr_mesh::{MeshConfig, PowerMode};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub nickname: Option<String>,
    pub mesh: MeshConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            nickname: None,
            mesh: MeshConfig::default(),
        }
    }
}

const CONFIG_FILE: &str = "config.json";
const IDENTITY_FILE: &str = "identity.key.v1";
const FAVORITES_FILE: &str = "favorites.v1";

pub fn load_config(config_dir: &Path) -> HostConfig {
    std::fs::read_to_string(config_dir.join(CONFIG_FILE))
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

pub fn save_config(config_dir: &Path, config: &HostConfig) -> io::Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(config_dir.join(CONFIG_FILE), data)
}

/// Loads the persisted `identity.key.v1` blob (§6), generating and
/// persisting a fresh one on first run.
pub fn load_or_create_identity(config_dir: &Path) -> io::Result<krtr_mesh::crypto::IdentityKeyPair> {
    let path = config_dir.join(IDENTITY_FILE);
    if let Ok(bytes) = std::fs::read(&path) {
        if let Ok(seed) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Ok(krtr_mesh::crypto::IdentityKeyPair::from_bytes(&seed));
        }
        tracing::debug!(?path, "identity blob present but malformed, regenerating");
    }
    let identity = krtr_mesh::crypto::IdentityKeyPair::generate();
    std::fs::create_dir_all(config_dir)?;
    std::fs::write(&path, identity.to_bytes())?;
    Ok(identity)
}

/// Loads the opaque `favorites.v1` fingerprint list (§6). The core never
/// interprets these beyond comparing against authenticated Fingerprints.
pub fn load_favorites(config_dir: &Path) -> Vec<krtr_proto::Fingerprint> {
    std::fs::read_to_string(config_dir.join(FAVORITES_FILE))
        .ok()
        .and_then(|data| serde_json::from_str::<Vec<String>>(&data).ok())
        .map(|hexes| hexes.iter().filter_map(|h| krtr_proto::Fingerprint::from_hex(h)).collect())
        .unwrap_or_default()
}

/// CLI overrides layered on top of `mesh`, mirroring §6's config table.
pub fn apply_overrides(mesh: &mut MeshConfig, args: &crate::Args) {
    if let Some(mode) = args.power_mode {
        mesh.power_mode = mode;
    }
    if let Some(v) = args.cover_traffic {
        mesh.cover_traffic_enabled = Some(v);
    }
    if let Some(v) = args.max_connections {
        mesh.max_connections = Some(v);
    }
    if let Some(v) = args.fragment_size {
        mesh.fragment_size = Some(v);
    }
    if let Some(v) = args.store_ttl_secs {
        mesh.store_ttl_secs = Some(v);
    }
    if let Some(v) = args.rotation_interval_secs {
        mesh.rotation_interval_secs = Some(v);
    }
}

pub fn power_mode_from_str(s: &str) -> Result<PowerMode, String> {
    match s {
        "performance" => Ok(PowerMode::Performance),
        "balanced" => Ok(PowerMode::Balanced),
        "powerSaver" | "power-saver" => Ok(PowerMode::PowerSaver),
        "ultraLowPower" | "ultra-low-power" => Ok(PowerMode::UltraLowPower),
        other => Err(format!("unknown power mode '{other}'")),
    }
}
