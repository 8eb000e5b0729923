use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::aoi::DEFAULT_RADIUS;
use crate::game::constants::net::DEFAULT_TIMEOUT_MS;
use crate::game::constants::world::{DEFAULT_HEIGHT_TILES, DEFAULT_WIDTH_TILES};

/// Read `name` from the environment, keeping `current` if it is unset,
/// unparsable or rejected by `valid`
fn env_override<T: FromStr>(name: &str, current: T, valid: impl Fn(&T) -> bool, rule: &str) -> T {
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            current
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the game listener to
    pub bind_address: IpAddr,
    /// Game listener port
    pub port: u16,
    /// Connections beyond this are refused
    pub max_clients: usize,
    /// Silent peers are dropped after this long
    pub connection_timeout: Duration,
    /// Area-of-interest radius in world units
    pub aoi_radius: f32,
    pub world_width_tiles: u32,
    pub world_height_tiles: u32,
    /// Crates scattered over the generated map
    pub crate_count: usize,
    /// Prometheus endpoint port, 0 to disable
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4100,
            max_clients: 256,
            connection_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            aoi_radius: DEFAULT_RADIUS,
            world_width_tiles: DEFAULT_WIDTH_TILES,
            world_height_tiles: DEFAULT_HEIGHT_TILES,
            crate_count: 40,
            metrics_port: 9100,
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env_override("BIND_ADDRESS", defaults.bind_address, |_| true, "an IP address"),
            port: env_override("PORT", defaults.port, |p| *p > 0, "> 0"),
            max_clients: env_override("MAX_CLIENTS", defaults.max_clients, |n| (1..=4096).contains(n), "1-4096"),
            connection_timeout: Duration::from_millis(env_override(
                "CONNECTION_TIMEOUT_MS",
                DEFAULT_TIMEOUT_MS,
                |ms| *ms >= 100,
                ">= 100",
            )),
            aoi_radius: env_override("AOI_RADIUS", defaults.aoi_radius, |r| r.is_finite() && *r > 0.0, "a positive number"),
            world_width_tiles: env_override(
                "WORLD_WIDTH_TILES",
                defaults.world_width_tiles,
                |w| (4..=4096).contains(w),
                "4-4096",
            ),
            world_height_tiles: env_override(
                "WORLD_HEIGHT_TILES",
                defaults.world_height_tiles,
                |h| (4..=4096).contains(h),
                "4-4096",
            ),
            crate_count: env_override("CRATE_COUNT", defaults.crate_count, |_| true, "a count"),
            metrics_port: env_override("METRICS_PORT", defaults.metrics_port, |_| true, "a port"),
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.metrics_port == self.port {
            return Err("metrics_port must differ from port".to_string());
        }
        if self.world_width_tiles < 4 || self.world_height_tiles < 4 {
            return Err("world must be at least 4x4 tiles".to_string());
        }
        if !(self.aoi_radius > 0.0) {
            return Err("aoi_radius must be positive".to_string());
        }
        Ok(())
    }

    pub fn socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Headless client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_address: SocketAddr,
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4100),
            connection_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    pub fn load_or_default() -> Self {
        let defaults = Self::default();
        Self {
            server_address: env_override("SERVER_ADDRESS", defaults.server_address, |_| true, "host:port"),
            connection_timeout: Duration::from_millis(env_override(
                "CONNECTION_TIMEOUT_MS",
                DEFAULT_TIMEOUT_MS,
                |ms| *ms >= 100,
                ">= 100",
            )),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server_address.port() == 0 {
            return Err("SERVER_ADDRESS port cannot be 0".to_string());
        }
        Ok(())
    }
}
