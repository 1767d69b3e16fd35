//! The agent state machine: a single cooperative loop that owns the
//! provisioner, OTA pipeline and device agent and drives them through
//! BOOT/WIFI_CONNECT/AP_PORTAL/IDLE/CHECK_UPDATE/DOWNLOAD/VERIFY/APPLY/
//! HEALTH_CHECK exactly as `main.c`'s `agent_task` does, translated from a
//! FreeRTOS tick-delay loop into one driven by `std::time::Instant`.

use crate::config::{
    AP_PORTAL_TIMEOUT, FIRMWARE_VERSION, HEALTH_CHECK_HEAP_MIN, HEARTBEAT_INTERVAL, IDLE_QUANTUM,
    OTA_CHECK_INTERVAL, PORTAL_RETRY_DELAY, WIFI_CONNECT_TIMEOUT,
};
use crate::error::AgentError;
use crate::ota::{CheckResult, DownloadResult, OtaPipeline, UpdateInfo};
use crate::provisioner::{ConnectResult, Provisioner};
use crate::{agent::DeviceAgent, diagnostics};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Boot,
    WifiConnect,
    ApPortal,
    Idle,
    CheckUpdate,
    Download,
    Verify,
    Apply,
    HealthCheck,
}

impl AgentState {
    fn name(self) -> &'static str {
        match self {
            AgentState::Boot => "BOOT",
            AgentState::WifiConnect => "WIFI_CONNECT",
            AgentState::ApPortal => "AP_PORTAL",
            AgentState::Idle => "IDLE",
            AgentState::CheckUpdate => "CHECK_UPDATE",
            AgentState::Download => "DOWNLOAD",
            AgentState::Verify => "VERIFY",
            AgentState::Apply => "APPLY",
            AgentState::HealthCheck => "HEALTH_CHECK",
        }
    }
}

pub struct Supervisor {
    provisioner: Provisioner,
    ota: OtaPipeline,
    agent: DeviceAgent,
    state: AgentState,
    pending_update: Option<UpdateInfo>,
    last_heartbeat: Option<Instant>,
    last_ota_check: Option<Instant>,
}

impl Supervisor {
    pub fn new(provisioner: Provisioner, ota: OtaPipeline, agent: DeviceAgent) -> Self {
        Self {
            provisioner,
            ota,
            agent,
            state: AgentState::Boot,
            pending_update: None,
            last_heartbeat: None,
            last_ota_check: None,
        }
    }

    /// Runs the state machine forever. Only returns by panicking after a
    /// rollback reboot call fails to actually reboot (see
    /// `OtaPipeline::rollback_and_reboot`) — every other terminal path
    /// reboots the device directly.
    pub fn run(mut self) -> ! {
        loop {
            info!(">> state: {}", self.state.name());
            self.state = match self.state {
                AgentState::Boot => self.on_boot(),
                AgentState::WifiConnect => self.on_wifi_connect(),
                AgentState::ApPortal => self.on_ap_portal(),
                AgentState::Idle => self.on_idle(),
                AgentState::CheckUpdate => self.on_check_update(),
                AgentState::Download => self.on_download(),
                AgentState::Verify => self.on_verify(),
                AgentState::Apply => self.on_apply(),
                AgentState::HealthCheck => self.on_health_check(),
            };
        }
    }

    fn on_boot(&mut self) -> AgentState {
        info!("firmware v{FIRMWARE_VERSION}");
        diagnostics::print_memory_summary("boot");
        match self.ota.is_pending_verify() {
            Ok(true) => {
                warn!("OTA pending verification, jumping to health check");
                AgentState::HealthCheck
            }
            Ok(false) => AgentState::WifiConnect,
            Err(e) => {
                error!("{}: failed to read OTA slot state: {e}, assuming committed", AgentError::UnknownState);
                AgentState::WifiConnect
            }
        }
    }

    fn on_wifi_connect(&mut self) -> AgentState {
        info!("connecting to saved wifi...");
        match self.provisioner.connect(WIFI_CONNECT_TIMEOUT) {
            ConnectResult::Ok => {
                info!("wifi connected, ip: {:?}", self.provisioner.current_ip());
                AgentState::Idle
            }
            ConnectResult::NoCredentials => {
                warn!("{}", AgentError::ConfigMissing);
                AgentState::ApPortal
            }
            ConnectResult::Fail | ConnectResult::Timeout => {
                warn!("{}, starting AP portal", AgentError::Transient);
                AgentState::ApPortal
            }
        }
    }

    fn on_ap_portal(&mut self) -> AgentState {
        info!("starting AP mode + captive portal...");
        if let Err(e) = self.provisioner.start_ap_portal() {
            error!("failed to start AP portal: {e}");
            thread::sleep(PORTAL_RETRY_DELAY);
            return AgentState::ApPortal;
        }

        let got_creds = self.provisioner.wait_for_portal_result(AP_PORTAL_TIMEOUT);
        self.provisioner.stop_ap_portal();

        if got_creds {
            info!("new credentials received, retrying wifi");
            AgentState::WifiConnect
        } else {
            warn!("AP portal timed out, retrying in {PORTAL_RETRY_DELAY:?}");
            thread::sleep(PORTAL_RETRY_DELAY);
            AgentState::ApPortal
        }
    }

    fn on_idle(&mut self) -> AgentState {
        let now = Instant::now();

        let due_for_heartbeat = self
            .last_heartbeat
            .map_or(true, |t| now.duration_since(t) >= HEARTBEAT_INTERVAL);
        if due_for_heartbeat {
            let rssi = self.provisioner.current_rssi();
            if let Err(e) = self.agent.send_heartbeat(FIRMWARE_VERSION, rssi) {
                warn!("heartbeat failed: {e}");
            }
            self.last_heartbeat = Some(now);
        }

        let due_for_ota_check = self
            .last_ota_check
            .map_or(true, |t| now.duration_since(t) >= OTA_CHECK_INTERVAL);
        if due_for_ota_check {
            self.last_ota_check = Some(now);
            return AgentState::CheckUpdate;
        }

        if !self.provisioner.is_connected() {
            warn!("wifi lost, reconnecting");
            return AgentState::WifiConnect;
        }

        thread::sleep(IDLE_QUANTUM);
        AgentState::Idle
    }

    fn on_check_update(&mut self) -> AgentState {
        info!("checking for OTA updates...");
        match self.ota.check_update(self.agent.device_id(), FIRMWARE_VERSION) {
            CheckResult::Available(info) => {
                info!(
                    "update available: v{} (deployment {})",
                    info.version, info.deployment_id
                );
                self.pending_update = Some(info);
                AgentState::Download
            }
            CheckResult::NoUpdate => {
                info!("firmware is up to date");
                AgentState::Idle
            }
            CheckResult::Error => {
                warn!("{} (server unreachable?)", AgentError::Transient);
                AgentState::Idle
            }
        }
    }

    fn on_download(&mut self) -> AgentState {
        let Some(info) = self.pending_update.clone() else {
            error!("DOWNLOAD reached with no pending update");
            return AgentState::Idle;
        };

        info!("downloading firmware v{}...", info.version);
        if let Err(e) = self.agent.report_ota_status("downloading", &info.version) {
            warn!("failed to report downloading status: {e}");
        }

        match self.ota.download(&info) {
            DownloadResult::Ok => {
                info!("download complete");
                AgentState::Verify
            }
            DownloadResult::Fail | DownloadResult::Timeout => {
                error!("{}", AgentError::Transient);
                if let Err(e) = self.agent.report_ota_status("failed", &info.version) {
                    warn!("failed to report failed status: {e}");
                }
                self.pending_update = None;
                AgentState::Idle
            }
        }
    }

    fn on_verify(&mut self) -> AgentState {
        let Some(info) = self.pending_update.clone() else {
            error!("VERIFY reached with no pending update");
            return AgentState::Idle;
        };

        info!("verifying firmware hash...");
        if self.ota.verify_hash(&info) {
            info!("SHA-256 verification passed");
            AgentState::Apply
        } else {
            error!("{}, aborting OTA", AgentError::CorruptedUpdate);
            if let Err(e) = self.agent.report_ota_status("failed", &info.version) {
                warn!("failed to report failed status: {e}");
            }
            self.ota.abort();
            self.pending_update = None;
            AgentState::Idle
        }
    }

    fn on_apply(&mut self) -> AgentState {
        let Some(info) = self.pending_update.take() else {
            error!("APPLY reached with no pending update");
            return AgentState::Idle;
        };

        info!("applying OTA update...");
        if self.ota.apply() {
            info!("OTA applied, rebooting in 3s...");
            if let Err(e) = self.agent.report_ota_status("applied", &info.version) {
                warn!("failed to report applied status: {e}");
            }
            thread::sleep(std::time::Duration::from_secs(3));
            unsafe { esp_idf_sys::esp_restart() }
        } else {
            error!("{}", AgentError::CorruptedUpdate);
            if let Err(e) = self.agent.report_ota_status("failed", &info.version) {
                warn!("failed to report failed status: {e}");
            }
            AgentState::Idle
        }
    }

    /// Runs the 3-probe post-OTA health check: free heap, Wi-Fi
    /// connectivity, and OTA server reachability. The first two are fatal
    /// (roll back immediately); the third is advisory only, matching
    /// `perform_health_check`'s own "non-fatal" comment on the reachability
    /// probe.
    fn on_health_check(&mut self) -> AgentState {
        let free_heap = diagnostics::get_free_heap();
        if free_heap < HEALTH_CHECK_HEAP_MIN {
            error!(
                "{}: free_heap={free_heap} < {HEALTH_CHECK_HEAP_MIN}",
                AgentError::PostUpdateRegression
            );
            let _ = self.agent.report_ota_status("failed", FIRMWARE_VERSION);
            self.ota.rollback_and_reboot();
        }

        if self.provisioner.connect(WIFI_CONNECT_TIMEOUT) != ConnectResult::Ok {
            error!("{}: wifi failed, rolling back", AgentError::PostUpdateRegression);
            let _ = self.agent.report_ota_status("failed", FIRMWARE_VERSION);
            self.ota.rollback_and_reboot();
        }

        if !self.ota.server_reachable() {
            warn!("health check WARN: OTA server unreachable (non-fatal)");
        }

        info!("health check passed (heap={free_heap})");
        if let Err(e) = self.ota.mark_valid() {
            error!("failed to mark running slot valid: {e}");
        }
        let _ = self.agent.report_ota_status("success", FIRMWARE_VERSION);
        AgentState::Idle
    }
}
