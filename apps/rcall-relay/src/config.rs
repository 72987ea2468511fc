use std::env;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Peers allowed in one room at a time
    pub room_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("RCALL_RELAY_PORT")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let room_capacity = env::var("RCALL_RELAY_ROOM_CAPACITY")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(DEFAULT_ROOM_CAPACITY);
        Self {
            port,
            room_capacity,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}
