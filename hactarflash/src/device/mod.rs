//! Serial endpoint discovery and USB bridge classification.
//!
//! A Hactar shows up as a USB-to-UART bridge wired to the management
//! chip's console. Classification here is only a pre-filter; identity is
//! confirmed by [`crate::host::probe_hactar`].

use {
    crate::{
        error::{Error, Result},
        port::{NativePortEnumerator, PortEnumerator, PortInfo},
    },
    log::{debug, trace},
    serde::Serialize,
};

/// How an endpoint is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// USB-to-UART bridge.
    UsbSerial,
    /// On-board or otherwise unidentified UART.
    Serial,
}

/// Known USB-to-UART bridge chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// WCH CH340/CH341/CH9102.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else.
    Unknown,
}

const KNOWN_BRIDGES: &[(u16, &[u16], DeviceKind)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x55D4], DeviceKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(v, pids, _)| *v == vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial endpoint with whatever USB metadata the OS reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedPort {
    /// Endpoint path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// How the endpoint is attached.
    pub transport: TransportKind,
    /// Bridge chip.
    pub device: DeviceKind,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        let transport = if info.vid.is_some() || is_usb_serial_name(&info.name) {
            TransportKind::UsbSerial
        } else {
            TransportKind::Serial
        };

        Self {
            name: info.name,
            transport,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether the endpoint is worth probing for a Hactar.
    pub fn is_candidate(&self) -> bool {
        self.transport == TransportKind::UsbSerial
    }
}

fn is_usb_serial_name(name: &str) -> bool {
    name.starts_with("/dev/ttyUSB") || name.starts_with("/dev/cu.usbserial")
}

/// All serial endpoints, sorted by name.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut ports: Vec<DetectedPort> = match NativePortEnumerator::list_ports() {
        Ok(ports) => ports.into_iter().map(DetectedPort::from).collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    };
    ports.sort_by(|a, b| a.name.cmp(&b.name));

    for port in &ports {
        trace!("Found {} ({:?}, {})", port.name, port.transport, port.device.name());
    }
    ports
}

/// Endpoints that could be a Hactar, sorted by name.
pub fn detect_candidate_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_candidate)
        .collect()
}

/// Find an endpoint whose name contains `pattern`.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    detect_ports()
        .into_iter()
        .find(|p| p.name.contains(pattern))
        .ok_or(Error::DeviceNotFound)
}

/// One display line per endpoint.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, usb: Option<(u16, u16)>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: usb.map(|(v, _)| v),
            pid: usb.map(|(_, p)| p),
            manufacturer: None,
            product: usb.map(|_| "USB-Serial".to_string()),
            serial_number: None,
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6015), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x1234), DeviceKind::Unknown);
        assert!(!DeviceKind::Unknown.is_known());
    }

    #[test]
    fn test_detected_port_from_info() {
        let usb = DetectedPort::from(info("/dev/ttyACM0", Some((0x0403, 0x6001))));
        assert_eq!(usb.device, DeviceKind::Ftdi);
        assert_eq!(usb.transport, TransportKind::UsbSerial);
        assert!(usb.is_candidate());

        let named = DetectedPort::from(info("/dev/ttyUSB3", None));
        assert_eq!(named.device, DeviceKind::Unknown);
        assert!(named.is_candidate());

        let onboard = DetectedPort::from(info("/dev/ttyS0", None));
        assert_eq!(onboard.transport, TransportKind::Serial);
        assert!(!onboard.is_candidate());
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            DetectedPort::from(info("/dev/ttyUSB0", Some((0x1A86, 0x7523)))),
            DetectedPort::from(info("/dev/ttyUSB1", Some((0x1234, 0x5678)))),
            DetectedPort::from(info("/dev/ttyS0", None)),
        ];

        let lines = format_port_list(&ports);
        assert_eq!(lines[0], "/dev/ttyUSB0 [CH340/CH341] - USB-Serial");
        assert_eq!(lines[1], "/dev/ttyUSB1 [VID:1234 PID:5678] - USB-Serial");
        assert_eq!(lines[2], "/dev/ttyS0");
    }
}
