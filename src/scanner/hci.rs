//! Raw HCI socket backend for beacon discovery.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.
//!
//! LE scanning is enabled only for the length of a discovery pass.

use super::{Discovery, ScanError, describe, record};
use crate::mac_address::MacAddress;
use crate::proximity::Observation;
use futures::future::BoxFuture;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// hci0
pub const DEFAULT_DEVICE: u16 = 0;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Active scanning, so scan responses carrying the local name arrive too
const LE_SCAN_ACTIVE: u8 = 0x01;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// 10ms in 0.625ms units
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

// AD types
const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Reported by the controller when no RSSI is available.
const RSSI_UNAVAILABLE: i8 = 127;

/// Max HCI event size
const EVENT_BUFFER_SIZE: usize = 258;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Parameters of LE Set Scan Parameters, in wire order.
fn scan_parameters() -> [u8; 7] {
    let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
    let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_ACTIVE,
        interval_lo,
        interval_hi,
        window_lo,
        window_hi,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Parameters of LE Set Scan Enable; duplicates are never filtered so every
/// report refreshes the RSSI.
fn scan_enable(enable: bool) -> [u8; 2] {
    [u8::from(enable), 0x00]
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: HCI_CHANNEL_RAW,
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket to hci{dev_id}: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Only let LE meta events through
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
    let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Parse an LE advertising report event into an observation.
///
/// Only the first report of the event is read; controllers send one report
/// per event in practice.
fn parse_advertising_report(packet: &[u8]) -> Option<Observation> {
    // packet type, event code, parameter length, subevent
    if packet.len() < 4
        || packet[0] != HCI_EVENT_PKT
        || packet[1] != EVT_LE_META_EVENT
        || packet[3] != EVT_LE_ADVERTISING_REPORT
    {
        return None;
    }
    let report = &packet[4..];

    // num_reports(1) + event_type(1) + addr_type(1) + addr(6) + data_len(1)
    if report.len() < 10 || report[0] == 0 {
        return None;
    }

    // HCI uses little-endian address
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse();

    let data_len = report[9] as usize;
    let ad_data = report.get(10..10 + data_len)?;
    let rssi = *report.get(10 + data_len)? as i8;
    if rssi == RSSI_UNAVAILABLE {
        return None;
    }

    Some(Observation {
        address: MacAddress(addr),
        rssi: i16::from(rssi),
        name: local_name(ad_data),
    })
}

/// Find the (complete or shortened) local name in advertising data.
fn local_name(ad_data: &[u8]) -> Option<String> {
    let mut offset = 0;
    let mut short = None;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let value = &ad_data[offset + 2..offset + 1 + len];
        match ad_data[offset + 1] {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                return Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_SHORT_LOCAL_NAME => short = Some(String::from_utf8_lossy(value).into_owned()),
            _ => {}
        }

        offset += 1 + len;
    }
    short
}

struct Sockets {
    events: AsyncFd<OwnedFd>,
    // A separate socket for commands, bound to the same device
    commands: OwnedFd,
}

pub struct HciDiscovery {
    dev_id: u16,
    sockets: Option<Sockets>,
}

impl HciDiscovery {
    pub fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            sockets: None,
        }
    }
}

impl Discovery for HciDiscovery {
    fn init(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            let events = open_hci_socket()?;
            bind_hci_socket(&events, self.dev_id)?;
            set_hci_filter(&events)?;

            let commands = open_hci_socket()?;
            bind_hci_socket(&commands, self.dev_id)?;
            send_hci_command(&commands, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters())?;

            let events = AsyncFd::new(events)
                .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;
            info!(dev_id = self.dev_id, "HCI socket ready");

            self.sockets = Some(Sockets { events, commands });
            Ok(())
        })
    }

    fn discover(
        &mut self,
        duration: Duration,
    ) -> BoxFuture<'_, Result<Vec<Observation>, ScanError>> {
        Box::pin(async move {
            let sockets = self.sockets.as_ref().ok_or(ScanError::NotInitialized)?;
            send_hci_command(&sockets.commands, OCF_LE_SET_SCAN_ENABLE, &scan_enable(true))?;

            let mut observations = Vec::new();
            let pass = timeout(duration, read_reports(&sockets.events, &mut observations));
            let result = match pass.await {
                Ok(Err(e)) => Err(e),
                // Running out the clock is the normal way for a pass to end.
                Ok(Ok(())) | Err(_) => Ok(()),
            };

            let stop = scan_enable(false);
            if let Err(e) = send_hci_command(&sockets.commands, OCF_LE_SET_SCAN_ENABLE, &stop) {
                warn!(error = %e, "failed to stop LE scan");
            }
            result.map(|()| observations)
        })
    }
}

/// Read advertising reports into `observations` until the socket fails.
async fn read_reports(
    events: &AsyncFd<OwnedFd>,
    observations: &mut Vec<Observation>,
) -> Result<(), ScanError> {
    let mut buf = [0u8; EVENT_BUFFER_SIZE];

    loop {
        let mut guard = events
            .readable()
            .await
            .map_err(|e| ScanError::Bluetooth(format!("HCI socket failed: {e}")))?;

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => break,
                Ok(Err(e)) => {
                    return Err(ScanError::Bluetooth(format!("Failed to read HCI event: {e}")));
                }
                // WouldBlock - no more data
                Err(_) => break,
            };

            if let Some(observation) = parse_advertising_report(&buf[..n]) {
                let name = observation.name.as_deref();
                debug!(device = %describe(&observation.address, observation.rssi, name), "advertisement");
                record(observations, observation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;

    /// LE advertising report event for AA:BB:CC:DD:EE:FF with the given AD
    /// structures and RSSI.
    fn report_packet(ad_data: &[u8], rssi: i8) -> Vec<u8> {
        let mut report = vec![
            0x01, // num_reports
            0x00, // ADV_IND
            0x00, // public address
            0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA,
            ad_data.len() as u8,
        ];
        report.extend_from_slice(ad_data);
        report.push(rssi as u8);

        let mut packet = vec![
            HCI_EVENT_PKT,
            EVT_LE_META_EVENT,
            (report.len() + 1) as u8,
            EVT_LE_ADVERTISING_REPORT,
        ];
        packet.extend_from_slice(&report);
        packet
    }

    #[test]
    fn test_hci_filter_setup() {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_hci_command_packet() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &scan_enable(true));
        // opcode 0x200C, little-endian
        assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);

        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
        assert_eq!(
            packet,
            vec![0x01, 0x0B, 0x20, 0x07, 0x01, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_parse_report_with_complete_name() {
        // flags, then complete local name "Lobby"
        let ad = [0x02, 0x01, 0x06, 0x06, 0x09, b'L', b'o', b'b', b'b', b'y'];
        let observation = parse_advertising_report(&report_packet(&ad, -65)).unwrap();

        assert_eq!(observation.address, TEST_MAC);
        assert_eq!(observation.rssi, -65);
        assert_eq!(observation.name.as_deref(), Some("Lobby"));
    }

    #[test]
    fn test_parse_report_prefers_complete_name() {
        let ad = [0x03, 0x08, b'L', b'o', 0x06, 0x09, b'L', b'o', b'b', b'b', b'y'];
        let observation = parse_advertising_report(&report_packet(&ad, -40)).unwrap();
        assert_eq!(observation.name.as_deref(), Some("Lobby"));

        let ad = [0x03, 0x08, b'L', b'o'];
        let observation = parse_advertising_report(&report_packet(&ad, -40)).unwrap();
        assert_eq!(observation.name.as_deref(), Some("Lo"));
    }

    #[test]
    fn test_parse_report_without_name() {
        let observation = parse_advertising_report(&report_packet(&[0x02, 0x01, 0x06], -80)).unwrap();
        assert_eq!(observation.rssi, -80);
        assert!(observation.name.is_none());
    }

    #[test]
    fn test_parse_report_rejects_bad_packets() {
        assert!(parse_advertising_report(&[]).is_none());
        assert!(parse_advertising_report(&report_packet(&[], RSSI_UNAVAILABLE)).is_none());

        // Truncated before the RSSI byte
        let mut packet = report_packet(&[0x02, 0x01, 0x06], -50);
        packet.pop();
        assert!(parse_advertising_report(&packet).is_none());

        // Not an advertising report
        let mut packet = report_packet(&[], -50);
        packet[3] = 0x01;
        assert!(parse_advertising_report(&packet).is_none());
    }

    #[test]
    fn test_malformed_ad_structure_is_ignored() {
        // Length runs past the end of the data
        assert_eq!(local_name(&[0x09, 0x09, b'x']), None);
        assert_eq!(local_name(&[0x00, 0x09]), None);
    }

    #[tokio::test]
    async fn test_discover_before_init_fails() {
        let mut discovery = HciDiscovery::new(DEFAULT_DEVICE);
        let result = discovery.discover(Duration::from_millis(1)).await;
        assert!(matches!(result, Err(ScanError::NotInitialized)));
    }
}
