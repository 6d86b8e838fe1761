//! mDNS announcement of the simulated device
//!
//! Registration is best-effort: every failure is logged and swallowed.

use ledsim_core::DeviceRuntime;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::protocol::PROTOCOL_VERSION;

pub const SERVICE_TYPE: &str = "_testdevice._udp.local.";

/// Registers the device with mDNS on creation and unregisters on shutdown
pub struct Announcer {
    daemon: Option<ServiceDaemon>,
    fullname: Option<String>,
}

impl Announcer {
    /// Register the device. The instance is named by the device serial so
    /// it stays unique across restarts.
    pub fn register(runtime: &DeviceRuntime) -> Self {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!(error = %e, "mDNS daemon unavailable, skipping registration");
                return Self {
                    daemon: None,
                    fullname: None,
                };
            }
        };

        let (width, height) = runtime.primary_dimensions();
        let properties: HashMap<String, String> = [
            ("width", width.to_string()),
            ("height", height.to_string()),
            ("protocol", "udp".to_string()),
            ("version", PROTOCOL_VERSION.to_string()),
            ("name", runtime.name().to_string()),
            ("description", runtime.description().to_string()),
            ("sn", runtime.serial().to_string()),
            ("outputs", runtime.outputs().len().to_string()),
            ("leds", runtime.total_leds().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let host = format!("{}.local.", runtime.serial());
        let service = match ServiceInfo::new(
            SERVICE_TYPE,
            runtime.serial(),
            &host,
            "",
            runtime.udp_port(),
            properties,
        ) {
            Ok(service) => service.enable_addr_auto(),
            Err(e) => {
                warn!(error = %e, "Failed to build mDNS service info");
                return Self {
                    daemon: Some(daemon),
                    fullname: None,
                };
            }
        };

        let fullname = service.get_fullname().to_string();
        match daemon.register(service) {
            Ok(()) => {
                info!(service = %fullname, port = runtime.udp_port(), "mDNS registered");
                Self {
                    daemon: Some(daemon),
                    fullname: Some(fullname),
                }
            }
            Err(e) => {
                warn!(error = %e, "mDNS registration failed");
                Self {
                    daemon: Some(daemon),
                    fullname: None,
                }
            }
        }
    }

    /// Unregister and shut the daemon down. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(daemon) = self.daemon.take() else {
            return;
        };
        if let Some(fullname) = self.fullname.take() {
            if let Err(e) = daemon.unregister(&fullname) {
                warn!(service = %fullname, error = %e, "mDNS unregister failed");
            }
        }
        let _ = daemon.shutdown();
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
