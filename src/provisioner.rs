//! Network provisioner: STA connect against stored credentials, and the
//! fallback AP captive portal used to collect new ones.
//!
//! Grounded on `wifi_manager.c` for the public surface (connect/is_connected/
//! get_ip/get_rssi, the AP SSID format, the 3 captive-portal routes and their
//! URL-decoding) and on `esp-idf-svc`'s `EspWifi`/`EspHttpServer` for the Rust
//! shape of each. The FreeRTOS event group the original used to hand
//! `WIFI_CONNECTED_BIT`/`WIFI_FAIL_BIT`/`PORTAL_DONE_BIT` from an ISR callback
//! to the waiting task is `crate::event_flags::EventFlags` here; the Wi-Fi
//! event and IP event callbacks below are where those bits get set.

use crate::config::AP_SSID_PREFIX;
use crate::credentials::{self, Credentials};
use crate::event_flags::{EventFlags, PORTAL_CREDENTIALS_RECEIVED, STA_CONNECTED, STA_FAILED};
use anyhow::{Context, Result};
use embedded_svc::http::Method;
use embedded_svc::io::{Read as _, Write as _};
use embedded_svc::ipv4::Ipv4Addr;
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::server::{Configuration as HttpServerConfiguration, EspHttpServer};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{EspWifi, WifiEvent};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Ok,
    Fail,
    Timeout,
    NoCredentials,
}

const PORTAL_HTML: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset='utf-8'>",
    "<meta name='viewport' content='width=device-width,initial-scale=1'>",
    "<title>Wi-Fi Setup</title></head><body>",
    "<form method='POST' action='/save'>",
    "<label>SSID</label><input type='text' name='ssid' maxlength='32' required>",
    "<label>Password</label><input type='password' name='password' maxlength='64'>",
    "<button type='submit'>Connect</button>",
    "</form></body></html>",
);

const PORTAL_SUCCESS_HTML: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset='utf-8'></head><body>",
    "<h2>Credentials saved</h2><p>The device will now try to connect.</p>",
    "</body></html>",
);

pub struct Provisioner {
    wifi: EspWifi<'static>,
    nvs: EspDefaultNvsPartition,
    flags: Arc<EventFlags>,
    // Kept alive for as long as the STA event subscription needs to observe
    // connect/disconnect/IP-assignment; dropping either unsubscribes it.
    _wifi_sub: Option<esp_idf_svc::eventloop::EspSubscription<'static, esp_idf_svc::eventloop::System>>,
    _ip_sub: Option<esp_idf_svc::eventloop::EspSubscription<'static, esp_idf_svc::eventloop::System>>,
    _reason_sub: Option<esp_idf_svc::eventloop::EspSubscription<'static, esp_idf_svc::eventloop::System>>,
    portal: Option<EspHttpServer<'static>>,
}

impl Provisioner {
    /// Wraps the modem in an `EspWifi` and subscribes to the Wi-Fi/IP events
    /// that flip `STA_CONNECTED`/`STA_FAILED` in `flags`. Does not start any
    /// radio mode yet — `connect()` and `start_ap_portal()` do that.
    pub fn init(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        flags: Arc<EventFlags>,
    ) -> Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs.clone()))
            .context("failed to initialize wifi driver")?;

        let wifi_sub = {
            let flags = flags.clone();
            sys_loop
                .subscribe::<WifiEvent, _>(move |event| match event {
                    WifiEvent::StaDisconnected => flags.set(STA_FAILED),
                    _ => {}
                })
                .context("failed to subscribe to wifi events")?
        };

        let ip_sub = {
            let flags = flags.clone();
            sys_loop
                .subscribe::<esp_idf_svc::netif::IpEvent, _>(move |event| {
                    if let esp_idf_svc::netif::IpEvent::DhcpIpAssigned(_) = event {
                        flags.set(STA_CONNECTED);
                    }
                })
                .context("failed to subscribe to ip events")?
        };

        // Subscribed raw (rather than via the typed `WifiEvent`, which
        // discards the payload) purely to log the disconnect reason code —
        // the same raw-event-data-pointer pattern the mesh event handler
        // used for `MESH_EVENT_PARENT_DISCONNECTED`.
        let reason_sub = sys_loop
            .subscribe_raw(
                unsafe { esp_idf_sys::WIFI_EVENT },
                esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED as i32,
                move |data| {
                    let reason = unsafe {
                        data.as_payload::<esp_idf_sys::wifi_event_sta_disconnected_t>()
                    }
                    .reason;
                    warn!(
                        "sta disconnected, reason: {} ({})",
                        reason,
                        crate::utils::get_disconnect_reason_string(reason)
                    );
                },
            )
            .context("failed to subscribe to raw wifi disconnect event")?;

        Ok(Self {
            wifi,
            nvs,
            flags,
            _wifi_sub: Some(wifi_sub),
            _ip_sub: Some(ip_sub),
            _reason_sub: Some(reason_sub),
            portal: None,
        })
    }

    /// Loads stored credentials and attempts an STA connection, blocking up
    /// to `timeout` for `STA_CONNECTED`/`STA_FAILED`. Mirrors
    /// `wifi_manager_connect`: a missing SSID is reported distinctly from a
    /// failed or timed-out attempt so the supervisor can route straight to
    /// the AP portal without first waiting out a connect timeout.
    pub fn connect(&mut self, timeout: Duration) -> ConnectResult {
        let creds = match credentials::load(&self.nvs) {
            Ok(Some(c)) => c,
            Ok(None) => return ConnectResult::NoCredentials,
            Err(e) => {
                error!("failed to read stored credentials: {e}");
                return ConnectResult::NoCredentials;
            }
        };

        if let Err(e) = self.apply_client_config(&creds) {
            error!("failed to apply wifi client configuration: {e}");
            return ConnectResult::Fail;
        }

        self.flags.clear(STA_CONNECTED);
        self.flags.clear(STA_FAILED);

        if let Err(e) = self.wifi.start() {
            error!("failed to start wifi: {e}");
            return ConnectResult::Fail;
        }
        if let Err(e) = self.wifi.connect() {
            error!("failed to initiate connection: {e}");
            let _ = self.wifi.stop();
            return ConnectResult::Fail;
        }

        let observed = self.flags.wait(STA_CONNECTED.0 | STA_FAILED.0, timeout);
        if observed & STA_CONNECTED.0 != 0 {
            info!("connected, ip: {:?}", self.current_ip());
            return ConnectResult::Ok;
        }

        let _ = self.wifi.stop();
        if observed & STA_FAILED.0 != 0 {
            ConnectResult::Fail
        } else {
            ConnectResult::Timeout
        }
    }

    fn apply_client_config(&mut self, creds: &Credentials) -> Result<()> {
        let auth_method = if creds.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        self.wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: creds.ssid.as_str().try_into().unwrap_or_default(),
            password: creds.password.as_str().try_into().unwrap_or_default(),
            auth_method,
            ..Default::default()
        }))?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    pub fn current_ip(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }

    /// Current RSSI of the associated AP, or `0` if not connected — matches
    /// `wifi_manager_get_rssi`'s "no AP info" fallback.
    pub fn current_rssi(&mut self) -> i8 {
        self.wifi
            .driver_mut()
            .get_ap_info()
            .map(|info| info.signal_strength)
            .unwrap_or(0)
    }

    /// Brings up a `ESP32-Setup-XXXX` open AP (last two MAC octets, upper
    /// hex) and a 3-route HTTP server on it: `GET /` serves the form,
    /// `POST /save` stores credentials and sets `PORTAL_CREDENTIALS_RECEIVED`,
    /// and any other URI 302-redirects back to `/` (captive portal
    /// detection), exactly as `wifi_manager_start_ap_portal` does.
    pub fn start_ap_portal(&mut self) -> Result<()> {
        let _ = self.wifi.stop();

        let mac = self.wifi.driver().get_mac(esp_idf_svc::wifi::WifiDeviceId::Ap)?;
        let ssid = format!("{AP_SSID_PREFIX}{:02X}{:02X}", mac[4], mac[5]);
        info!("starting AP portal: {ssid}");

        self.wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ssid.as_str().try_into().unwrap_or_default(),
            auth_method: AuthMethod::None,
            channel: 1,
            max_connections: 4,
            ..Default::default()
        }))?;
        self.wifi.start()?;

        self.flags.clear(PORTAL_CREDENTIALS_RECEIVED);

        let nvs = self.nvs.clone();
        let flags = self.flags.clone();
        let mut server = EspHttpServer::new(&HttpServerConfiguration {
            uri_match_wildcard: true,
            ..Default::default()
        })
        .context("failed to start captive portal http server")?;

        server.fn_handler("/", Method::Get, |req| {
            req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())
        })?;

        {
            let nvs = nvs.clone();
            let flags = flags.clone();
            server.fn_handler("/save", Method::Post, move |mut req| {
                let mut buf = [0u8; 256];
                let n = req.read(&mut buf)?;
                let body = String::from_utf8_lossy(&buf[..n]);

                let Some(ssid) = extract_form_value(&body, "ssid") else {
                    req.into_status_response(400)?;
                    return Ok(());
                };
                let password = extract_form_value(&body, "password").unwrap_or_default();

                info!("portal: received ssid '{ssid}'");
                if let Err(e) = credentials::save(&nvs, &ssid, &password) {
                    error!("failed to save credentials: {e}");
                    req.into_status_response(500)?;
                    return Ok(());
                }

                req.into_ok_response()?
                    .write_all(PORTAL_SUCCESS_HTML.as_bytes())?;
                flags.set(PORTAL_CREDENTIALS_RECEIVED);
                Ok(())
            })?;
        }

        server.fn_handler("/*", Method::Get, |req| {
            req.into_response(302, Some("Found"), &[("Location", "http://192.168.4.1/")])?;
            Ok::<(), esp_idf_svc::io::EspIOError>(())
        })?;

        self.portal = Some(server);
        Ok(())
    }

    /// Blocks up to `timeout` for `PORTAL_CREDENTIALS_RECEIVED`.
    pub fn wait_for_portal_result(&self, timeout: Duration) -> bool {
        self.flags.wait(PORTAL_CREDENTIALS_RECEIVED.0, timeout) & PORTAL_CREDENTIALS_RECEIVED.0 != 0
    }

    pub fn stop_ap_portal(&mut self) {
        self.portal = None;
        let _ = self.wifi.stop();
        info!("ap portal stopped");
    }

    pub fn erase_credentials(&self) -> Result<()> {
        credentials::erase(&self.nvs)
    }
}

/// Extracts `key`'s value from an `application/x-www-form-urlencoded` body
/// (`key1=val1&key2=val2`), URL-decoding `%HH` and `+` as `wifi_manager.c`'s
/// `extract_form_value`/`url_decode` do.
fn extract_form_value(body: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    for pair in body.split('&') {
        if let Some(value) = pair.strip_prefix(needle.as_str()) {
            return Some(url_decode(value));
        }
    }
    None
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_value() {
        assert_eq!(
            extract_form_value("ssid=home&password=abc", "ssid"),
            Some("home".to_string())
        );
    }

    #[test]
    fn extracts_last_field_without_trailing_ampersand() {
        assert_eq!(
            extract_form_value("ssid=home&password=abc", "password"),
            Some("abc".to_string())
        );
    }

    #[test]
    fn decodes_percent_and_plus_escapes() {
        assert_eq!(url_decode("my+wifi%20net"), "my wifi net");
    }

    #[test]
    fn missing_key_returns_none() {
        assert_eq!(extract_form_value("ssid=home", "password"), None);
    }

    #[test]
    fn empty_password_round_trips() {
        assert_eq!(extract_form_value("ssid=home&password=", "password"), Some(String::new()));
    }
}
