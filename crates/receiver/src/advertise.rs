//! mDNS advertisement of the receiver as `_googlecast._tcp.local.`.

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::device::Device;

const SERVICE_TYPE: &str = "_googlecast._tcp.local.";

pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

/// TXT records senders expect from a cast device.
fn txt_records(device: &Device) -> Vec<(String, String)> {
    vec![
        ("id".to_string(), device.id.clone()),
        ("md".to_string(), device.device_model.clone()),
        ("fn".to_string(), device.friendly_name.clone()),
        ("ca".to_string(), "4101".to_string()),
        ("st".to_string(), "0".to_string()),
        ("nf".to_string(), "1".to_string()),
        ("ve".to_string(), "02".to_string()),
        ("ic".to_string(), "/setup/icon.png".to_string()),
    ]
}

/// Start advertising the receiver on the local network.
pub fn start(device: &Device, port: u16) -> Result<Advertisement> {
    let daemon = ServiceDaemon::new().context("failed to start mdns daemon")?;

    let instance = device.id.clone();
    let hostname = format!("{}.local.", device.id);
    let records = txt_records(device);
    let properties: Vec<(&str, &str)> = records
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &instance,
        &hostname,
        "",
        port,
        &properties[..],
    )
    .context("failed to build mdns service info")?
    .enable_addr_auto();

    let fullname = info.get_fullname().to_string();
    daemon
        .register(info)
        .context("failed to register mdns service")?;
    tracing::info!(%fullname, port, "advertising receiver");

    Ok(Advertisement { daemon, fullname })
}

impl Advertisement {
    /// Withdraw the advertisement and shut the daemon down.
    pub fn stop(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::warn!("failed to unregister mdns service: {e}");
        }
        let _ = self.daemon.shutdown();
        tracing::info!("stopped advertising");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::media::NullDecoder;

    use super::*;

    #[test]
    fn txt_records_carry_required_keys() {
        let (device, _frames) = Device::new("test-model", "Test Device", Arc::new(NullDecoder));
        let records = txt_records(&device);
        for key in ["id", "md", "fn", "ca", "ve", "st", "nf", "ic"] {
            assert!(
                records.iter().any(|(k, _)| k == key),
                "missing txt record {key}"
            );
        }
        let ca = records.iter().find(|(k, _)| k == "ca").unwrap();
        assert_eq!(ca.1, "4101");
        let ve = records.iter().find(|(k, _)| k == "ve").unwrap();
        assert_eq!(ve.1, "02");
    }
}
