#[macro_use]
mod logging;
mod diagnostics;

mod agent;
mod config;
mod credentials;
mod error;
mod event_flags;
mod ota;
mod provisioner;
mod supervisor;
mod utils;

use agent::DeviceAgent;
use anyhow::Result;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use event_flags::EventFlags;
use ota::OtaPipeline;
use provisioner::Provisioner;
use std::sync::Arc;
use supervisor::Supervisor;

fn main() -> Result<()> {
    diagnostics::print_memory_stats("STARTUP");
    let mem_after_startup = diagnostics::get_free_heap();

    esp_idf_sys::link_patches();
    diagnostics::print_memory_delta("After ESP IDF Sys Link Patches", mem_after_startup);
    let mem_after_link_patches = diagnostics::get_free_heap();

    esp_idf_svc::log::EspLogger::initialize_default();
    diagnostics::print_memory_delta(
        "After ESP IDF Svc Log Esp Logger Initialize Default",
        mem_after_link_patches,
    );

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║  Fleet Agent Firmware                                ║");
    info!(
        "║  Version: {}                                      ║",
        config::FIRMWARE_VERSION
    );
    info!("╚══════════════════════════════════════════════════════╝");

    let mem_before_nvs = diagnostics::get_free_heap();
    let nvs = EspDefaultNvsPartition::take()?;
    diagnostics::print_memory_delta("After NVS Init", mem_before_nvs);

    let sys_loop = EspSystemEventLoop::take()?;
    let peripherals = Peripherals::take()?;

    let mem_before_ota = diagnostics::get_free_heap();
    let ota = OtaPipeline::init()?;
    diagnostics::print_memory_delta("After OTA Pipeline Init", mem_before_ota);

    let mem_before_wifi = diagnostics::get_free_heap();
    let flags = Arc::new(EventFlags::new());
    let provisioner = Provisioner::init(peripherals.modem, sys_loop, nvs.clone(), flags)?;
    diagnostics::print_memory_delta("After Provisioner Init", mem_before_wifi);

    let mem_before_agent = diagnostics::get_free_heap();
    let agent = DeviceAgent::init(&nvs)?;
    diagnostics::print_memory_delta("After Device Agent Init", mem_before_agent);

    let supervisor = Supervisor::new(provisioner, ota, agent);
    supervisor.run();
}
