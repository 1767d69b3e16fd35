//! Device identity and the two control-plane calls that originate from the
//! device rather than from the OTA pipeline: heartbeat and OTA status report.
//!
//! Grounded on `device_agent.c`: identity is loaded once from the
//! `device_cfg`/`device_id` NVS namespace, falling back to a compiled-in
//! default, and the boot timestamp is recorded at `init()` for the uptime
//! field of every heartbeat. There is no network call for "status" — the
//! reference only logs it, so neither does this module.

use crate::config::{CONTROL_PLANE_TIMEOUT, DEFAULT_DEVICE_ID, SERVER_BASE_URL};
use anyhow::{Context, Result};
use embedded_svc::http::Method;
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use serde::Serialize;
use std::time::Instant;

const NAMESPACE: &str = "device_cfg";
const KEY_DEVICE_ID: &str = "device_id";

#[derive(Serialize)]
struct Heartbeat<'a> {
    device_id: &'a str,
    firmware_version: &'a str,
    rssi: i8,
    free_heap: u32,
    uptime: u64,
}

pub struct DeviceAgent {
    device_id: String,
    booted_at: Instant,
}

impl DeviceAgent {
    /// Loads `device_cfg`/`device_id` from NVS, falling back to
    /// [`DEFAULT_DEVICE_ID`] when absent, and starts the uptime clock.
    pub fn init(partition: &EspDefaultNvsPartition) -> Result<Self> {
        let device_id = load_device_id(partition).unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        info!("device id: {}", device_id);
        Ok(Self {
            device_id,
            booted_at: Instant::now(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn uptime_seconds(&self) -> u64 {
        self.booted_at.elapsed().as_secs()
    }

    /// POSTs `{device_id, firmware_version, rssi, free_heap, uptime}` to
    /// `/api/telemetry/heartbeat`. Failures are transient by definition —
    /// callers log and continue rather than treat this as fatal.
    pub fn send_heartbeat(&self, firmware_version: &str, rssi: i8) -> Result<()> {
        let body = Heartbeat {
            device_id: &self.device_id,
            firmware_version,
            rssi,
            free_heap: crate::diagnostics::get_free_heap(),
            uptime: self.uptime_seconds(),
        };
        let payload = serde_json::to_vec(&body).context("failed to encode heartbeat")?;
        let url = format!("{SERVER_BASE_URL}/api/telemetry/heartbeat");
        let status = post_json(&url, &payload)?;
        if status >= 300 {
            anyhow::bail!("heartbeat rejected with status {status}");
        }
        Ok(())
    }

    /// POSTs an empty JSON body to
    /// `/api/ota/report?device_id=...&status=...&version=...`.
    pub fn report_ota_status(&self, status: &str, version: &str) -> Result<()> {
        let url = format!(
            "{SERVER_BASE_URL}/api/ota/report?device_id={}&status={}&version={}",
            urlencode(&self.device_id),
            urlencode(status),
            urlencode(version),
        );
        let code = post_json(&url, b"{}")?;
        if code >= 300 {
            anyhow::bail!("ota status report rejected with status {code}");
        }
        Ok(())
    }
}

fn load_device_id(partition: &EspDefaultNvsPartition) -> Option<String> {
    let nvs = EspNvs::<NvsDefault>::new(partition.clone(), NAMESPACE, false).ok()?;
    let mut buf = [0u8; 64];
    nvs.get_str(KEY_DEVICE_ID, &mut buf)
        .ok()
        .flatten()
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Issues a single POST with a JSON content-type header and returns the
/// response status. Uses the raw `Connection` trait rather than the
/// higher-level request builder since it needs to write a body before
/// reading the response.
fn post_json(url: &str, body: &[u8]) -> Result<u16> {
    let mut conn = EspHttpConnection::new(&Configuration {
        buffer_size: Some(1024),
        timeout: Some(CONTROL_PLANE_TIMEOUT),
        ..Default::default()
    })
    .context("failed to open http connection")?;

    let content_len = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_len.as_str()),
    ];

    conn.initiate_request(Method::Post, url, &headers)
        .context("failed to initiate request")?;
    conn.write_all(body).context("failed to write body")?;
    conn.initiate_response().context("failed to read response")?;

    let status = conn.status();
    // Drain the body so the connection can be reused; size here is small
    // enough that a fixed buffer and a bounded number of reads suffice.
    let mut scratch = [0u8; 256];
    loop {
        match conn.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    Ok(status)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::urlencode;

    #[test]
    fn urlencode_leaves_unreserved_characters_alone() {
        assert_eq!(urlencode("device-01_A.1~"), "device-01_A.1~");
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("v1.0.0 rc1"), "v1.0.0%20rc1");
    }
}
