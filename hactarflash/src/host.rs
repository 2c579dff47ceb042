//! Host-side discovery of Hactar boards.
//!
//! Candidate ports are probed one after another, never in parallel, so
//! boards behind one USB hub do not disturb each other.

use {
    crate::{
        command::{self, HELLO, MgmtCommand, OK_LINE_LEN},
        device::{self, DetectedPort},
        error::Result,
        port::{NativePort, Port, SerialConfig},
        protocol::transport::try_read,
    },
    log::{debug, info, warn},
    std::time::Duration,
};

/// Read timeout while probing a port.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    device::detect_ports()
}

/// Ask the management firmware behind `port` to identify itself.
///
/// Log forwarding is silenced for the probe and restored afterwards.
pub fn probe_hactar<P: Port + ?Sized>(port: &mut P) -> Result<bool> {
    command::silence_logs(port)?;
    command::send(port, MgmtCommand::WhoAreYou)?;

    let reply = try_read(port, OK_LINE_LEN + HELLO.len())?.unwrap_or_default();
    command::send(port, MgmtCommand::DefaultLogging)?;

    Ok(reply.get(OK_LINE_LEN..) == Some(HELLO))
}

/// Probe `port`, then close it. A failed close is logged and does not
/// change the probe result.
fn probe_and_close<P: Port>(mut port: P, name: &str) -> Result<bool> {
    let confirmed = probe_hactar(&mut port);
    if let Err(e) = port.close() {
        warn!("Failed to close {name}: {e}");
    }
    confirmed
}

/// Probe every candidate port and return those answering as a Hactar,
/// sorted by name. Ports that cannot be opened are skipped.
#[must_use]
pub fn discover_hactar_ports(baud: u32) -> Vec<DetectedPort> {
    let mut found = Vec::new();

    for candidate in device::detect_candidate_ports() {
        let config = SerialConfig::new(&candidate.name, baud).with_timeout(PROBE_TIMEOUT);
        let port = match NativePort::open(&config) {
            Ok(port) => port,
            Err(e) => {
                debug!("Skipping {}: {e}", candidate.name);
                continue;
            },
        };

        match probe_and_close(port, &candidate.name) {
            Ok(true) => {
                info!("Hactar found on {}", candidate.name);
                found.push(candidate);
            },
            Ok(false) => debug!("{} is not a Hactar", candidate.name),
            Err(e) => debug!("Probing {} failed: {e}", candidate.name),
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{Event, MockPort};

    #[test]
    fn test_probe_confirms_identity() {
        let mut port = MockPort::new();
        port.reply(b"[ui] boot ok\n").silence().reply(b"Ok\n").reply(HELLO);

        assert!(probe_hactar(&mut port).unwrap());
        assert_eq!(
            port.writes(),
            vec![
                MgmtCommand::DisableLogs.frame(),
                MgmtCommand::WhoAreYou.frame(),
                MgmtCommand::DefaultLogging.frame(),
            ]
        );
    }

    #[test]
    fn test_probe_rejects_other_reply() {
        let mut port = MockPort::new();
        port.silence().reply(b"Ok\nHELLO, I AM A TOASTER DEVICE");
        assert!(!probe_hactar(&mut port).unwrap());

        let mut silent = MockPort::new();
        assert!(!probe_hactar(&mut silent).unwrap());
        assert_eq!(silent.writes().len(), 3);
    }

    #[test]
    fn test_identity_check_survives_failed_close() {
        let port = MockPort::new();
        port.silence().reply(b"Ok\n").reply(HELLO).fail_close();

        assert!(probe_and_close(port.clone(), "mock").unwrap());
        assert_eq!(port.events().last(), Some(&Event::Close));
    }
}
