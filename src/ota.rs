//! OTA pipeline: check for updates, stream a firmware image into the
//! inactive partition while hashing it, verify, and arm the boot switch.
//!
//! Grounded on `ota_manager.c` for operation semantics (chunk size, safety
//! cap, progress log cadence) and on `esp_idf_svc::ota::{EspOta, EspOtaUpdate}`
//! for the partition/bootloader handshake — `initiate_update()` opens the
//! next update partition, `EspOtaUpdate::complete()` finalises the write and
//! calls `esp_ota_set_boot_partition`, which is exactly the point ESP-IDF's
//! own rollback support marks the slot pending-verify.

use crate::config::{
    CHECK_UPDATE_RESPONSE_CAP, CONTROL_PLANE_TIMEOUT, DOWNLOAD_CHUNK_SIZE,
    DOWNLOAD_PROGRESS_LOG_INTERVAL, DOWNLOAD_SOCKET_TIMEOUT, REACHABILITY_TIMEOUT,
    SERVER_BASE_URL,
};
use anyhow::{Context, Result};
use embedded_svc::http::client::Client;
use embedded_svc::http::Method;
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::ota::{EspOta, EspOtaUpdate, Slot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of `check_update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    NoUpdate,
    Available(UpdateInfo),
    Error,
}

/// Outcome of `download`. `Timeout` is a specialisation of `Fail` kept as a
/// distinct variant only because the reference firmware declares one; the
/// supervisor treats both identically (see `crate::supervisor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadResult {
    Ok,
    Fail,
    Timeout,
}

/// Everything the download/verify/apply steps need, produced once by
/// `check_update`. Lives on the stack of one supervisor iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub version: String,
    pub expected_hash: String,
    pub download_url: String,
    pub deployment_id: String,
    pub artifact_size: u32,
}

#[derive(Deserialize)]
struct CheckUpdateResponse {
    update_available: bool,
    #[serde(default)]
    version: String,
    #[serde(default)]
    artifact_hash: String,
    #[serde(default)]
    download_url: String,
    #[serde(default)]
    deployment_id: String,
}

#[derive(Serialize)]
struct CheckUpdateRequest<'a> {
    device_id: &'a str,
    current_version: &'a str,
}

/// The transient bundle of (target partition, writer, hasher) bound to one
/// download attempt: exactly one writer and one hasher exist together, or
/// neither does.
struct OtaSession {
    update: EspOtaUpdate<'static>,
    hasher: Sha256,
}

pub struct OtaPipeline {
    // `EspOtaUpdate<'a>`'s lifetime ties it to the `&mut EspOta` that produced
    // it via `initiate_update`, so a session can't sit next to an owned
    // `EspOta` as a sibling field. Leaking the `EspOta` onto the heap gives it
    // a `'static` lifetime instead, the same fix the mesh firmware's own OTA
    // state used for this exact borrow.
    esp_ota: *mut EspOta,
    running_slot: Slot,
    session: Option<OtaSession>,
}

// Safety: esp_ota points to a leaked Box that lives for 'static and is never
// aliased across threads — OtaPipeline is owned by the single supervisor task.
unsafe impl Send for OtaPipeline {}

impl OtaPipeline {
    /// Records the running partition and warns if the bootloader's recorded
    /// boot partition disagrees with it (a sign a previous OTA left things
    /// in an unexpected state).
    pub fn init() -> Result<Self> {
        let ota = EspOta::new().context("failed to initialize OTA subsystem")?;
        let running_slot = ota
            .get_running_slot()
            .context("failed to read running OTA slot")?;
        if let Ok(boot_slot) = ota.get_boot_slot() {
            if boot_slot.label != running_slot.label {
                warn!(
                    "boot partition '{}' disagrees with running partition '{}'",
                    boot_slot.label, running_slot.label
                );
            }
        }
        info!("running from OTA slot '{}'", running_slot.label);
        let esp_ota: *mut EspOta = Box::leak(Box::new(ota));
        Ok(Self {
            esp_ota,
            running_slot,
            session: None,
        })
    }

    pub fn running_slot(&self) -> &Slot {
        &self.running_slot
    }

    /// Returns true if the running image has not yet been committed —
    /// the `BOOT -> HEALTH_CHECK` branch in `crate::supervisor`.
    pub fn is_pending_verify(&self) -> Result<bool> {
        Ok(self.running_slot.state == esp_idf_svc::ota::SlotState::Unverified)
    }

    /// POSTs `{device_id, current_version}` to `/api/ota/check`; resolves
    /// `download_url` against the server base before handing back
    /// [`UpdateInfo`]. A single request/response cycle (see spec's Open
    /// Questions on the reference's double-request quirk).
    pub fn check_update(&self, device_id: &str, current_version: &str) -> CheckResult {
        let url = format!("{SERVER_BASE_URL}/api/ota/check");
        let body = CheckUpdateRequest {
            device_id,
            current_version,
        };
        let payload = match serde_json::to_vec(&body) {
            Ok(p) => p,
            Err(_) => return CheckResult::Error,
        };

        let response = match post_json(&url, &payload) {
            Ok(r) => r,
            Err(_) => return CheckResult::Error,
        };

        if response.status != 200 {
            warn!("ota check: non-200 status {}", response.status);
            return CheckResult::Error;
        }
        if response.body.is_empty() || response.body.len() > CHECK_UPDATE_RESPONSE_CAP {
            warn!("ota check: response body size {} out of bounds", response.body.len());
            return CheckResult::Error;
        }

        let parsed: CheckUpdateResponse = match serde_json::from_slice(&response.body) {
            Ok(p) => p,
            Err(_) => {
                warn!("ota check: failed to parse response body");
                return CheckResult::Error;
            }
        };

        if !parsed.update_available {
            return CheckResult::NoUpdate;
        }

        let download_url = if parsed.download_url.starts_with("http") {
            parsed.download_url
        } else {
            format!("{SERVER_BASE_URL}{}", parsed.download_url)
        };

        CheckResult::Available(UpdateInfo {
            version: parsed.version,
            expected_hash: parsed.artifact_hash,
            download_url,
            deployment_id: parsed.deployment_id,
            artifact_size: 0,
        })
    }

    /// Opens the next OTA partition, streams the firmware over HTTP in
    /// `DOWNLOAD_CHUNK_SIZE` chunks, writing each chunk to the partition and
    /// then feeding it to the hasher — in that order, so the verified hash
    /// is exactly what landed on flash. A second concurrent session is
    /// rejected outright; in practice this is already enforced structurally
    /// by the supervisor only ever calling this from `DOWNLOAD`.
    pub fn download(&mut self, info: &UpdateInfo) -> DownloadResult {
        if self.session.is_some() {
            error!("download() called with a session already active");
            return DownloadResult::Fail;
        }

        // Safety: esp_ota points to a leaked Box that lives for 'static.
        let update = match unsafe { (*self.esp_ota).initiate_update() } {
            Ok(u) => u,
            Err(e) => {
                error!("failed to initiate OTA update: {e}");
                return DownloadResult::Fail;
            }
        };

        self.session = Some(OtaSession {
            update,
            hasher: Sha256::new(),
        });

        let connection = match EspHttpConnection::new(&HttpConfiguration {
            buffer_size: Some(DOWNLOAD_CHUNK_SIZE),
            timeout: Some(DOWNLOAD_SOCKET_TIMEOUT),
            ..Default::default()
        }) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to open download connection: {e}");
                self.abort();
                return DownloadResult::Fail;
            }
        };

        let mut client = Client::wrap(connection);
        let mut request = match client.get(&info.download_url) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to build download request: {e}");
                self.abort();
                return DownloadResult::Fail;
            }
        };

        let mut response = match request.submit() {
            Ok(r) => r,
            Err(e) => {
                error!("download request failed: {e}");
                self.abort();
                return DownloadResult::Fail;
            }
        };

        if response.status() != 200 {
            error!("download: non-200 status {}", response.status());
            self.abort();
            return DownloadResult::Fail;
        }

        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut total: usize = 0;
        let mut next_log_at = DOWNLOAD_PROGRESS_LOG_INTERVAL;

        loop {
            let n = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("download read failed: {e}");
                    self.abort();
                    return DownloadResult::Fail;
                }
            };

            let session = self.session.as_mut().expect("session set above");
            if let Err(e) = session.update.write(&buffer[..n]) {
                error!("partition write failed: {e}");
                self.abort();
                return DownloadResult::Fail;
            }
            session.hasher.update(&buffer[..n]);

            total += n;
            if total >= next_log_at {
                info!("download progress: {} KiB", total / 1024);
                next_log_at += DOWNLOAD_PROGRESS_LOG_INTERVAL;
            }
        }

        info!("download complete: {total} bytes");
        DownloadResult::Ok
    }

    /// Finalises the hasher and compares it case-insensitively against
    /// `info.expected_hash`. Consumes the hasher; the writer stays open for
    /// `apply()`. Returns false (without touching the session) if no
    /// download is active.
    pub fn verify_hash(&mut self, info: &UpdateInfo) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let digest = std::mem::take(&mut session.hasher).finalize();
        let computed = hex_lower(&digest);
        let matches = computed.eq_ignore_ascii_case(&info.expected_hash);
        if matches {
            info!("hash verified: {computed}");
        } else {
            error!("hash mismatch: computed {computed}, expected {}", info.expected_hash);
        }
        matches
    }

    /// Closes the writer (finalising the image) and arms the bootloader to
    /// boot the downloaded slot next reset. The slot is left pending-verify
    /// — `ESP-IDF`'s own app-rollback support reverts it unless
    /// `crate::supervisor`'s `HEALTH_CHECK` later commits.
    pub fn apply(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        match session.update.complete() {
            Ok(()) => {
                info!("OTA applied, next boot targets the new slot (pending-verify)");
                true
            }
            Err(e) => {
                error!("failed to finalize OTA update: {e}");
                false
            }
        }
    }

    /// Discards any active session. Idempotent — a second call with no
    /// session present is a no-op. Dropping `EspOtaUpdate` aborts the
    /// in-progress `esp_ota` handle.
    pub fn abort(&mut self) {
        if self.session.take().is_some() {
            warn!("OTA session aborted");
        }
    }

    /// Issues *commit*: clears pending-verify on the running slot.
    pub fn mark_valid(&mut self) -> Result<()> {
        // Safety: esp_ota points to a leaked Box that lives for 'static.
        unsafe { (*self.esp_ota).mark_running_slot_valid() }
            .context("failed to mark running slot valid")
    }

    /// Issues *rollback*: marks the running slot invalid and reboots onto
    /// the prior slot. Never returns on success.
    pub fn rollback_and_reboot(&mut self) -> ! {
        // Safety: esp_ota points to a leaked Box that lives for 'static.
        let err = unsafe { (*self.esp_ota).mark_running_slot_invalid_and_reboot() };
        panic!("rollback did not reboot the device: {err}");
    }

    /// Best-effort liveness probe against a fixed small endpoint.
    pub fn server_reachable(&self) -> bool {
        let url = format!("{SERVER_BASE_URL}/api/ota/public-key");
        let connection = match EspHttpConnection::new(&HttpConfiguration {
            timeout: Some(REACHABILITY_TIMEOUT),
            ..Default::default()
        }) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let mut client = Client::wrap(connection);
        let request = match client.get(&url) {
            Ok(r) => r,
            Err(_) => return false,
        };
        match request.submit() {
            Ok(response) => response.status() == 200,
            Err(_) => false,
        }
    }
}

struct HttpResponse {
    status: u16,
    body: Vec<u8>,
}

/// Issues a single POST with a JSON content-type header, reading the whole
/// (capped) response body into memory. Uses the raw `Connection` trait, the
/// way `crate::agent::post_json` does, since a request body must be written
/// before the response can be read.
fn post_json(url: &str, body: &[u8]) -> Result<HttpResponse> {
    let mut conn = EspHttpConnection::new(&HttpConfiguration {
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
    let mut out = Vec::new();
    let mut scratch = [0u8; 512];
    loop {
        match conn.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n <= CHECK_UPDATE_RESPONSE_CAP {
                    out.extend_from_slice(&scratch[..n]);
                } else {
                    out.extend_from_slice(&scratch[..n]);
                    break;
                }
            }
            Err(_) => break,
        }
    }
    Ok(HttpResponse { status, body: out })
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::hex_lower;

    #[test]
    fn hex_lower_renders_lowercase() {
        assert_eq!(hex_lower(&[0xAB, 0x12]), "ab12");
    }

    #[test]
    fn hash_compare_is_case_insensitive() {
        let expected = "AB12EF";
        let computed = hex_lower(&[0xab, 0x12, 0xef]);
        assert!(computed.eq_ignore_ascii_case(expected));
    }
}
