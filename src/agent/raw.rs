//! Raw Ethernet (Layer 2) Wake-on-LAN capture
//!
//! Classic WoL senders emit Ethernet frames with EtherType `0x0842` to the
//! broadcast MAC, never touching UDP. Capturing them takes an `AF_PACKET`
//! socket per interface (requires `CAP_NET_RAW`) with a kernel-side BPF
//! filter so only WoL frames reach userspace. The receive loop is a plain
//! blocking thread; `shutdown(SHUT_RD)` wakes it at stop.
//!
//! Linux only. On other platforms the agent runs with UDP capture alone.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::packet::{decode_magic_payload, format_mac, is_broadcast_mac};
use crate::Error;

/// EtherType for Wake-on-LAN frames.
pub const WOL_ETHERTYPE: u16 = 0x0842;
/// EtherType of an 802.1Q VLAN tag.
const VLAN_ETHERTYPE: u16 = 0x8100;
/// Ethernet header size.
const ETH_HEADER_LEN: usize = 14;

/// A network interface eligible for raw WoL capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateInterface {
    /// Interface name (e.g. `eth0`, `br-ex`)
    pub name: String,
    /// Kernel interface index
    pub index: i32,
    /// Hardware address
    pub mac: [u8; 6],
}

/// A WoL frame captured on the raw path.
#[derive(Clone, Debug)]
pub struct RawFrame {
    /// Target MAC extracted from the magic payload, canonical form.
    pub target_mac: String,
    /// Source MAC of the Ethernet frame.
    pub source_mac: [u8; 6],
    /// Interface the frame was captured on.
    pub interface: String,
}

/// Name-based eligibility: physical NICs, Wi-Fi, and Linux bridges are in;
/// virtual/overlay devices are out.
pub fn is_candidate_name(name: &str) -> bool {
    if name.starts_with("veth")
        || name.starts_with("tap")
        || name.starts_with("ovs-")
        || name.starts_with("ovn-")
        || name.starts_with("br-int")
        || name.contains("@if")
    {
        return false;
    }
    name.starts_with("en")
        || name.starts_with("eth")
        || name.starts_with("wlp")
        || name.starts_with("br-")
}

/// Deduplicates candidates sharing a MAC (a bridge and its physical peer
/// report the same address); the bridge wins. Output is name-sorted.
pub fn select_interfaces(candidates: Vec<CandidateInterface>) -> Vec<CandidateInterface> {
    let mut by_mac: HashMap<[u8; 6], CandidateInterface> = HashMap::new();

    for iface in candidates {
        let replace = match by_mac.get(&iface.mac) {
            None => true,
            Some(existing) if existing.name.starts_with("br-") => {
                debug!(
                    iface = %iface.name,
                    kept = %existing.name,
                    "skipping duplicate MAC (bridge already selected)"
                );
                false
            }
            Some(existing) if iface.name.starts_with("br-") => {
                debug!(
                    iface = %iface.name,
                    replaced = %existing.name,
                    "preferring bridge over physical peer with same MAC"
                );
                true
            }
            Some(existing) => {
                debug!(iface = %iface.name, kept = %existing.name, "skipping duplicate MAC");
                false
            }
        };
        if replace {
            by_mac.insert(iface.mac, iface);
        }
    }

    let mut selected: Vec<_> = by_mac.into_values().collect();
    selected.sort_by(|a, b| a.name.cmp(&b.name));
    selected
}

/// Enumerates interfaces eligible for WoL capture from `/sys/class/net`.
pub fn candidate_interfaces() -> io::Result<Vec<CandidateInterface>> {
    scan_interfaces(Path::new("/sys/class/net"))
}

fn scan_interfaces(root: &Path) -> io::Result<Vec<CandidateInterface>> {
    let mut found = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        let flags = read_hex(&path.join("flags")).unwrap_or(0);
        if flags & libc::IFF_LOOPBACK as u64 != 0
            || flags & libc::IFF_UP as u64 == 0
            || flags & libc::IFF_BROADCAST as u64 == 0
        {
            continue;
        }
        if !is_candidate_name(&name) {
            continue;
        }
        let Some(mac) = read_mac(&path.join("address")) else {
            continue;
        };
        let Some(index) = read_index(&path.join("ifindex")) else {
            continue;
        };

        found.push(CandidateInterface { name, index, mac });
    }

    let selected = select_interfaces(found);
    for iface in &selected {
        info!(
            interface = %iface.name,
            mac = %format_mac(&iface.mac),
            "selected WoL capture interface"
        );
    }
    Ok(selected)
}

fn read_hex(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    u64::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

fn read_index(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_mac(path: &Path) -> Option<[u8; 6]> {
    let raw = fs::read_to_string(path).ok()?;
    let mut mac = [0u8; 6];
    let mut parts = raw.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Parses an Ethernet frame, returning the WoL target MAC and the frame's
/// source MAC iff the frame is a broadcast WoL frame with a valid magic
/// payload. Handles a single 802.1Q VLAN tag.
pub fn parse_wol_frame(frame: &[u8]) -> Option<(String, [u8; 6])> {
    if frame.len() <= ETH_HEADER_LEN {
        return None;
    }

    let dst: [u8; 6] = frame[0..6].try_into().ok()?;
    let src: [u8; 6] = frame[6..12].try_into().ok()?;
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut payload = &frame[ETH_HEADER_LEN..];

    if ethertype == VLAN_ETHERTYPE {
        if payload.len() < 4 {
            return None;
        }
        // payload[0..2] is the TCI, payload[2..4] the inner EtherType.
        ethertype = u16::from_be_bytes([payload[2], payload[3]]);
        payload = &payload[4..];
    }

    if ethertype != WOL_ETHERTYPE {
        return None;
    }
    if !is_broadcast_mac(&dst) {
        return None;
    }

    let mac = decode_magic_payload(payload)?;
    Some((mac, src))
}

/// A raw capture socket bound to one interface, read on its own thread.
pub struct RawListener {
    interface: String,
    fd: libc::c_int,
    closed: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RawListener {
    /// Opens the packet socket and starts the capture thread. Captured WoL
    /// frames are delivered on `frames`.
    pub fn start(
        iface: &CandidateInterface,
        frames: mpsc::Sender<RawFrame>,
    ) -> Result<Self, Error> {
        let fd = open_packet_socket(iface).map_err(|e| {
            Error::capture(format!(
                "failed to open raw socket on {} (requires CAP_NET_RAW): {e}",
                iface.name
            ))
        })?;

        let closed = Arc::new(AtomicBool::new(false));
        let name = iface.name.clone();
        let handle = {
            let closed = closed.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("wol-raw-{name}"))
                .spawn(move || listen_loop(fd, name, closed, frames))
                .map_err(Error::Io)?
        };

        info!(interface = %name, fd, "raw Ethernet WoL listener started");
        Ok(Self {
            interface: name,
            fd,
            closed,
            handle: Some(handle),
        })
    }

    /// The interface this listener captures on.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Stops the capture thread and closes the socket.
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocked reader, then join before closing the fd.
        // SAFETY: fd is open until after the join below.
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RD);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // SAFETY: the reader thread has exited; nothing else uses the fd.
        unsafe {
            libc::close(self.fd);
        }
        debug!(interface = %self.interface, "raw Ethernet listener stopped");
    }
}

impl Drop for RawListener {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn listen_loop(
    fd: libc::c_int,
    interface: String,
    closed: Arc<AtomicBool>,
    frames: mpsc::Sender<RawFrame>,
) {
    // Slightly more than the usual MTU to leave room for VLAN tags.
    let mut buf = [0u8; 2048];
    debug!(interface = %interface, "raw capture loop started");

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        // SAFETY: buf outlives the call and len matches its size.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                _ => {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!(interface = %interface, error = %err, "error reading raw packet");
                    continue;
                }
            }
        }
        if n == 0 {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            continue;
        }

        if let Some((target_mac, source_mac)) = parse_wol_frame(&buf[..n as usize]) {
            info!(
                target_mac = %target_mac,
                source_mac = %format_mac(&source_mac),
                interface = %interface,
                "valid WoL magic packet received (raw Ethernet)"
            );
            let frame = RawFrame {
                target_mac,
                source_mac,
                interface: interface.clone(),
            };
            if frames.blocking_send(frame).is_err() {
                return;
            }
        }
    }
}

fn open_packet_socket(iface: &CandidateInterface) -> io::Result<libc::c_int> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    // SAFETY: plain socket creation; fd is closed below on any setup error.
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let setup = || -> io::Result<()> {
        // Bind to the interface.
        // SAFETY: sockaddr_ll is zero-initialized then filled; valid for the call.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = iface.index;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        // Promiscuous membership so broadcasts not addressed to our MAC are
        // seen; non-fatal.
        let mreq = libc::packet_mreq {
            mr_ifindex: iface.index,
            mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        // SAFETY: mreq outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!(
                interface = %iface.name,
                error = %io::Error::last_os_error(),
                "failed to enable promiscuous mode"
            );
        }

        if let Err(e) = attach_wol_filter(fd) {
            debug!(interface = %iface.name, error = %e, "failed to attach BPF filter");
        }

        // Receive timeout so the loop can observe shutdown within a second.
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        // SAFETY: tv outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!(
                interface = %iface.name,
                error = %io::Error::last_os_error(),
                "failed to set receive timeout"
            );
        }

        Ok(())
    };

    match setup() {
        Ok(()) => Ok(fd),
        Err(e) => {
            // SAFETY: fd is open and not shared yet.
            unsafe {
                libc::close(fd);
            }
            Err(e)
        }
    }
}

/// Attaches the classic BPF program "accept iff EtherType == 0x0842".
fn attach_wol_filter(fd: libc::c_int) -> io::Result<()> {
    let mut filter = [
        // ldh [12] - load the EtherType halfword
        libc::sock_filter {
            code: 0x28,
            jt: 0,
            jf: 0,
            k: 12,
        },
        // jeq #0x0842 - fall through on match, skip one on mismatch
        libc::sock_filter {
            code: 0x15,
            jt: 0,
            jf: 1,
            k: WOL_ETHERTYPE as u32,
        },
        // ret #0x40000 - accept the whole packet
        libc::sock_filter {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0x0004_0000,
        },
        // ret #0 - drop
        libc::sock_filter {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ];
    let prog = libc::sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_mut_ptr(),
    };
    // SAFETY: prog and the filter array outlive the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const libc::sock_fprog as *const libc::c_void,
            mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_magic_packet;

    const SAMPLE_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
    const BROADCAST: [u8; 6] = [0xFF; 6];

    fn frame(dst: &[u8; 6], src: &[u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(dst);
        out.extend_from_slice(src);
        out.extend_from_slice(&ethertype.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn vlan_frame(dst: &[u8; 6], src: &[u8; 6], inner: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(dst);
        out.extend_from_slice(src);
        out.extend_from_slice(&VLAN_ETHERTYPE.to_be_bytes());
        out.extend_from_slice(&[0x00, 0x64]); // TCI: VLAN 100
        out.extend_from_slice(&inner.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    const SRC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    // =========================================================================
    // Frame parsing
    // =========================================================================

    #[test]
    fn accepts_wol_frame() {
        let f = frame(&BROADCAST, &SRC, WOL_ETHERTYPE, &build_magic_packet(&SAMPLE_MAC));
        let (mac, src) = parse_wol_frame(&f).expect("valid WoL frame");
        assert_eq!(mac, "52:54:00:12:34:56");
        assert_eq!(src, SRC);
    }

    #[test]
    fn accepts_vlan_tagged_wol_frame() {
        let f = vlan_frame(&BROADCAST, &SRC, WOL_ETHERTYPE, &build_magic_packet(&SAMPLE_MAC));
        let (mac, _) = parse_wol_frame(&f).expect("VLAN-tagged WoL frame");
        assert_eq!(mac, "52:54:00:12:34:56");
    }

    #[test]
    fn rejects_vlan_frame_with_other_inner_type() {
        // Inner IPv4: not WoL even though the payload happens to be magic.
        let f = vlan_frame(&BROADCAST, &SRC, 0x0800, &build_magic_packet(&SAMPLE_MAC));
        assert!(parse_wol_frame(&f).is_none());
    }

    #[test]
    fn rejects_non_broadcast_destination() {
        let f = frame(&SAMPLE_MAC, &SRC, WOL_ETHERTYPE, &build_magic_packet(&SAMPLE_MAC));
        assert!(parse_wol_frame(&f).is_none());
    }

    #[test]
    fn rejects_wrong_ethertype() {
        let f = frame(&BROADCAST, &SRC, 0x0800, &build_magic_packet(&SAMPLE_MAC));
        assert!(parse_wol_frame(&f).is_none());
    }

    #[test]
    fn rejects_invalid_magic_payload() {
        let mut payload = build_magic_packet(&SAMPLE_MAC);
        payload[30] ^= 0xFF;
        let f = frame(&BROADCAST, &SRC, WOL_ETHERTYPE, &payload);
        assert!(parse_wol_frame(&f).is_none());
    }

    #[test]
    fn rejects_runt_frames() {
        assert!(parse_wol_frame(&[]).is_none());
        assert!(parse_wol_frame(&[0xFF; 14]).is_none());
        // VLAN tag announced but truncated
        let f = frame(&BROADCAST, &SRC, VLAN_ETHERTYPE, &[0x00, 0x64]);
        assert!(parse_wol_frame(&f).is_none());
    }

    // =========================================================================
    // Interface selection
    // =========================================================================

    #[test]
    fn name_filter_includes_physical_wifi_and_bridges() {
        for name in ["eth0", "enp3s0", "eno1", "wlp2s0", "br-ex", "br-0"] {
            assert!(is_candidate_name(name), "{name} should be eligible");
        }
    }

    #[test]
    fn name_filter_excludes_virtual_devices() {
        for name in [
            "lo",
            "veth1a2b",
            "tap0",
            "ovs-system",
            "ovn-k8s-mp0",
            "br-int",
            "eth0@if12",
            "docker0",
            "flannel.1",
        ] {
            assert!(!is_candidate_name(name), "{name} should be excluded");
        }
    }

    fn iface(name: &str, index: i32, mac: [u8; 6]) -> CandidateInterface {
        CandidateInterface {
            name: name.to_string(),
            index,
            mac,
        }
    }

    #[test]
    fn bridge_wins_over_physical_peer_with_same_mac() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

        // Physical first, bridge second: the bridge replaces it.
        let selected = select_interfaces(vec![iface("eth0", 2, mac), iface("br-ex", 5, mac)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "br-ex");

        // Bridge first, physical second: the bridge is kept.
        let selected = select_interfaces(vec![iface("br-ex", 5, mac), iface("eth0", 2, mac)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "br-ex");
    }

    #[test]
    fn duplicate_physical_macs_keep_the_first() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let selected = select_interfaces(vec![iface("eth0", 2, mac), iface("eth1", 3, mac)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "eth0");
    }

    #[test]
    fn distinct_macs_are_all_selected_sorted() {
        let selected = select_interfaces(vec![
            iface("wlp2s0", 4, [0x00, 0x11, 0x22, 0x33, 0x44, 0x57]),
            iface("eth0", 2, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            iface("br-ex", 5, [0x00, 0x11, 0x22, 0x33, 0x44, 0x56]),
        ]);
        let names: Vec<_> = selected.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["br-ex", "eth0", "wlp2s0"]);
    }

    // =========================================================================
    // sysfs parsing helpers
    // =========================================================================

    #[test]
    fn parses_sysfs_mac_format() {
        let dir = std::env::temp_dir().join(format!("wakevirt-raw-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("address");

        fs::write(&path, "52:54:00:ab:cd:ef\n").unwrap();
        assert_eq!(
            read_mac(&path),
            Some([0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF])
        );

        fs::write(&path, "not-a-mac\n").unwrap();
        assert_eq!(read_mac(&path), None);

        // Infiniband-style 20-byte addresses are rejected.
        fs::write(&path, "00:11:22:33:44:55:66:77\n").unwrap();
        assert_eq!(read_mac(&path), None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn parses_sysfs_flags_format() {
        let dir = std::env::temp_dir().join(format!("wakevirt-flags-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flags");

        fs::write(&path, "0x1003\n").unwrap();
        let flags = read_hex(&path).unwrap();
        assert_ne!(flags & libc::IFF_UP as u64, 0);
        assert_ne!(flags & libc::IFF_BROADCAST as u64, 0);
        assert_eq!(flags & libc::IFF_LOOPBACK as u64, 0);

        fs::remove_dir_all(&dir).unwrap();
    }
}
