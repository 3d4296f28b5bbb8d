use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use simgate::{CapsConfig, CircuitConfig, DEFAULT_HTTP_PORT, DEFAULT_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub name: String,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            name: "Default Region".to_string(),
            grid_x: 1000,
            grid_y: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub home_uri: String,
    pub inventory_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub udp_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub max_circuits: usize,
    pub stats_interval_secs: u64,
    pub scene: SceneConfig,
    pub grid: GridConfig,
    pub circuit: CircuitConfig,
    pub caps: CapsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            max_circuits: 256,
            stats_interval_secs: 30,
            scene: SceneConfig::default(),
            grid: GridConfig::default(),
            circuit: CircuitConfig::default(),
            caps: CapsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }
}
