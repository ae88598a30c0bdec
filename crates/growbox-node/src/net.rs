use std::fs;
use std::path::{Path, PathBuf};

use growbox::profile::WirelessCredentials;

use tracing::{debug, warn};

use crate::error::RadioError;
use crate::link::Radio;

// Root directory for network interfaces metadata on Linux.
const NET_DIR: &str = "/sys/class/net";

const IFACE_TYPE_ETHERNET: u16 = 1;

/// The radio of a Linux host.
///
/// The association itself is managed by the operating system: associating
/// selects a wireless interface, or a physical one when the host has no
/// wireless interface, and succeeds once that interface is up. Only the
/// network name of the credentials is used, in the logs.
#[derive(Debug, Clone)]
pub struct HostRadio {
    root: PathBuf,
    iface: Option<Interface>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Interface {
    path: PathBuf,
    mac: [u8; 6],
    wireless: bool,
}

impl Default for HostRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRadio {
    /// Creates a [`HostRadio`] reading interfaces from `/sys/class/net`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(NET_DIR)
    }

    /// Creates a [`HostRadio`] reading interfaces from the given directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            iface: None,
        }
    }

    fn select_interface(&self) -> Result<Interface, RadioError> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            RadioError::Unavailable(format!("unable to read {}: {e}", self.root.display()))
        })?;

        let mut wireless = None;
        let mut wired = None;

        for entry in entries.flatten() {
            let path = entry.path();

            let Some(mac) = read_mac(&path) else {
                continue;
            };

            if is_virtual_interface(&path, mac) {
                continue;
            }

            let wireless_iface = path.join("wireless").exists();
            let slot = if wireless_iface {
                &mut wireless
            } else if interface_type(&path) == Some(IFACE_TYPE_ETHERNET) {
                &mut wired
            } else {
                continue;
            };

            if slot.is_none() {
                *slot = Some(Interface {
                    path,
                    mac,
                    wireless: wireless_iface,
                });
            }
        }

        wireless
            .or(wired)
            .ok_or_else(|| RadioError::Unavailable("no physical network interface".into()))
    }
}

impl Radio for HostRadio {
    async fn associate(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError> {
        let iface = self.select_interface()?;
        let name = iface
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !iface.wireless {
            warn!(
                "No wireless interface, using `{name}` instead of `{}`",
                credentials.ssid
            );
        }

        let up = is_up(&iface.path);
        self.iface = Some(iface);

        if up {
            debug!("Interface `{name}` is up");
            Ok(())
        } else {
            Err(RadioError::Rejected(format!("interface `{name}` is down")))
        }
    }

    fn is_associated(&self) -> bool {
        self.iface.as_ref().is_some_and(|iface| is_up(&iface.path))
    }

    fn unique_id(&self) -> Vec<u8> {
        self.iface
            .as_ref()
            .map(|iface| iface.mac.to_vec())
            .or_else(|| self.select_interface().ok().map(|iface| iface.mac.to_vec()))
            .unwrap_or_default()
    }
}

fn is_up(iface_path: &Path) -> bool {
    fs::read_to_string(iface_path.join("operstate")).is_ok_and(|state| state.trim() == "up")
}

fn is_virtual_interface(iface_path: &Path, mac: [u8; 6]) -> bool {
    // Without a "device" entry, the interface is not backed by hardware.
    if !iface_path.join("device").exists() {
        return true;
    }

    // Locally administered addresses are assigned by software.
    if mac[0] & 0x02 != 0 {
        return true;
    }

    iface_path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            name == "lo"
                || ["docker", "br-", "veth", "tun", "tap", "vmnet"]
                    .iter()
                    .any(|p| name.starts_with(p))
        })
}

fn read_mac(iface_path: &Path) -> Option<[u8; 6]> {
    let mac_str = fs::read_to_string(iface_path.join("address")).ok()?;

    let mut mac = [0u8; 6];
    let mut parts = mac_str.trim().split(':');

    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(mac)
}

fn interface_type(iface_path: &Path) -> Option<u16> {
    fs::read_to_string(iface_path.join("type"))
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
}
