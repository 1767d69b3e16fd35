//! Compile-time configuration for the fleet agent.
//!
//! Everything here is a constant: there is no runtime configuration store.
//! A production build overrides the server/device defaults at the call site
//! (or via a `build.rs`-injected `env!`), not by editing these in place.

use std::time::Duration;

/// Base URL of the fleet control-plane. Every control-plane path in
/// `crate::ota` and `crate::agent` is resolved against this.
pub const SERVER_BASE_URL: &str = "https://your-server.com";

/// Device id used until a value is persisted under `device_cfg`/`device_id`.
pub const DEFAULT_DEVICE_ID: &str = "REPLACE_WITH_DEVICE_ID";

/// Firmware version string sent to the server. Treated as opaque — see
/// `crate::ota`'s module docs for why no semver comparison happens on-device.
pub const FIRMWARE_VERSION: &str = "1.0.0";

pub const OTA_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const AP_PORTAL_TIMEOUT: Duration = Duration::from_secs(300);
pub const PORTAL_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const IDLE_QUANTUM: Duration = Duration::from_secs(1);

pub const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DOWNLOAD_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum free heap (bytes) a post-update boot must retain to pass probe 1
/// of `HEALTH_CHECK`.
pub const HEALTH_CHECK_HEAP_MIN: u32 = 32 * 1024;

/// Streaming download chunk size.
pub const DOWNLOAD_CHUNK_SIZE: usize = 4096;

/// Log a progress line every this many downloaded bytes.
pub const DOWNLOAD_PROGRESS_LOG_INTERVAL: usize = 64 * 1024;

/// Reject a `/api/ota/check` response body larger than this.
pub const CHECK_UPDATE_RESPONSE_CAP: usize = 2048;

/// Prefix for the provisioning access point's SSID; the last two MAC octets
/// (uppercase hex) are appended, e.g. `ESP32-Setup-4F2A`.
pub const AP_SSID_PREFIX: &str = "ESP32-Setup-";
