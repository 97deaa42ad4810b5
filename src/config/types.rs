use serde::{Deserialize, Serialize};

use crate::device::constants::{DEVICE_NAME, SOCKET_URL};
use crate::device::types::TransportKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub transport: TransportKind,
    /// Advertised name of the controller on the packet transport
    pub device_name: String,
    pub socket_url: String,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: TransportKind::Packet,
            device_name: DEVICE_NAME.to_string(),
            socket_url: SOCKET_URL.to_string(),
            scan_timeout_ms: 15000,
            connect_timeout_ms: 10000,
            health_check_interval_ms: 30000,
            health_check_timeout_ms: 2000,
            retry_delay_ms: 2000,
            max_retries: 5,
        }
    }
}
