//! Raw packet socket with a memory-mapped receive ring (Linux AF_PACKET)
//!
//! The socket is bound to one interface, the filter is attached in the
//! kernel with `SO_ATTACH_FILTER`, and frames are taken from a
//! `TPACKET_V2` ring shared with the kernel. Every frame is copied out of
//! its slot and the slot is handed back before the frame is returned.

pub use imp::RingBackend;

/// Ring geometry for a given snapshot length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub block_size: u32,
    pub block_nr: u32,
    pub frame_size: u32,
    pub frame_nr: u32,
}

const TPACKET_ALIGNMENT: u32 = 16;
/// `TPACKET_ALIGN(sizeof(struct tpacket2_hdr))` plus room for `sockaddr_ll`
const TPACKET2_HDRLEN: u32 = 32 + 20;
const RING_BYTES: u32 = 4 * 1024 * 1024;
const PAGE_SIZE: u32 = 4096;

impl RingGeometry {
    /// Frames sized to hold `snaplen` bytes plus headers, about 4 MiB in total
    pub fn for_snaplen(snaplen: u32) -> Self {
        let needed = align(TPACKET2_HDRLEN, TPACKET_ALIGNMENT)
            + align(snaplen.saturating_add(TPACKET_ALIGNMENT), TPACKET_ALIGNMENT);
        let frame_size = needed.next_power_of_two().max(TPACKET_ALIGNMENT * 8);
        let block_size = frame_size.max(PAGE_SIZE);
        let block_nr = (RING_BYTES / block_size).max(1);
        Self {
            block_size,
            block_nr,
            frame_size,
            frame_nr: block_nr * (block_size / frame_size),
        }
    }

    /// Total bytes mapped
    pub fn len(&self) -> usize {
        self.block_size as usize * self.block_nr as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) & !(to - 1)
}

#[cfg(target_os = "linux")]
mod imp {
    use super::RingGeometry;
    use crate::backend::{CaptureBackend, FrameRead};
    use crate::bpf::FilterProgram;
    use crate::stats::{CaptureStats, StatsAccumulator};
    use sniwatch_core::{BackendKind, CaptureConfig, Error, LinkType, RawFrame, Result};
    use std::io;
    use std::mem;
    use std::os::fd::RawFd;
    use std::ptr;
    use std::sync::atomic::{fence, Ordering};
    use std::time::{Duration, Instant, UNIX_EPOCH};
    use tracing::{debug, error, info, trace};

    const PACKET_RX_RING: libc::c_int = 5;
    const PACKET_STATISTICS: libc::c_int = 6;
    const PACKET_VERSION: libc::c_int = 10;
    const TPACKET_V2: libc::c_int = 1;
    const TP_STATUS_KERNEL: u32 = 0;
    const TP_STATUS_USER: u32 = 1;

    const ARPHRD_ETHER: u16 = 1;
    const ARPHRD_LOOPBACK: u16 = 772;
    const ARPHRD_NONE: u16 = 0xfffe;

    #[repr(C)]
    struct TpacketReq {
        tp_block_size: libc::c_uint,
        tp_block_nr: libc::c_uint,
        tp_frame_size: libc::c_uint,
        tp_frame_nr: libc::c_uint,
    }

    #[repr(C)]
    struct Tpacket2Hdr {
        tp_status: u32,
        tp_len: u32,
        tp_snaplen: u32,
        tp_mac: u16,
        tp_net: u16,
        tp_sec: u32,
        tp_nsec: u32,
        tp_vlan_tci: u16,
        tp_vlan_tpid: u16,
        tp_padding: [u8; 4],
    }

    #[repr(C)]
    #[derive(Default)]
    struct TpacketStats {
        tp_packets: libc::c_uint,
        tp_drops: libc::c_uint,
    }

    /// Owned packet socket; closed on drop
    struct PacketSocket(RawFd);

    impl PacketSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    impl Drop for PacketSocket {
        fn drop(&mut self) {
            // SAFETY: self.0 is a socket we opened and nothing else closes it.
            unsafe {
                libc::close(self.0);
            }
            trace!(fd = self.0, "Packet socket closed");
        }
    }

    /// Receive ring mapped from the socket; unmapped on drop
    struct MappedRing {
        ptr: *mut u8,
        geometry: RingGeometry,
    }

    // SAFETY: the mapping is only touched through &mut self of the owning
    // backend, which is moved between threads but never shared.
    unsafe impl Send for MappedRing {}

    impl MappedRing {
        fn slot(&self, index: u32) -> *mut Tpacket2Hdr {
            // SAFETY: index < frame_nr, so the offset stays inside the mapping.
            unsafe {
                self.ptr
                    .add(index as usize * self.geometry.frame_size as usize)
                    .cast::<Tpacket2Hdr>()
            }
        }
    }

    impl Drop for MappedRing {
        fn drop(&mut self) {
            // SAFETY: ptr/len describe a mapping created by mmap in open().
            unsafe {
                libc::munmap(self.ptr.cast(), self.geometry.len());
            }
        }
    }

    /// AF_PACKET ring backend
    pub struct RingBackend {
        interface: String,
        // Declared before `socket` so the ring is unmapped first
        ring: Option<MappedRing>,
        socket: Option<PacketSocket>,
        link_type: LinkType,
        read_timeout: Duration,
        next_slot: u32,
        stats: StatsAccumulator,
    }

    impl RingBackend {
        pub fn is_supported() -> bool {
            true
        }

        /// Open a ring on the interface with kernel index `ifindex`
        pub fn open(config: &CaptureConfig, ifindex: u32) -> Result<Self> {
            let name = config.interface.as_str();
            let protocol = (libc::ETH_P_ALL as u16).to_be();

            // SAFETY: plain socket(2) call; the result is checked.
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    protocol as libc::c_int,
                )
            };
            if fd < 0 {
                return Err(Error::from_acquire_errno(io::Error::last_os_error(), name));
            }
            let socket = PacketSocket(fd);

            set_option(&socket, libc::SOL_PACKET, PACKET_VERSION, &TPACKET_V2)
                .map_err(|e| Error::from_acquire_errno(e, name))?;

            let geometry = RingGeometry::for_snaplen(config.snaplen);
            let request = TpacketReq {
                tp_block_size: geometry.block_size,
                tp_block_nr: geometry.block_nr,
                tp_frame_size: geometry.frame_size,
                tp_frame_nr: geometry.frame_nr,
            };
            set_option(&socket, libc::SOL_PACKET, PACKET_RX_RING, &request)
                .map_err(|e| Error::from_acquire_errno(e, name))?;

            // SAFETY: maps the ring just configured on our own socket; the
            // result is checked against MAP_FAILED.
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    geometry.len(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    socket.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::from_acquire_errno(io::Error::last_os_error(), name));
            }
            let ring = MappedRing {
                ptr: ptr.cast(),
                geometry,
            };

            // SAFETY: sockaddr_ll is plain old data; zeroed is a valid value.
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = protocol;
            addr.sll_ifindex = ifindex as libc::c_int;

            // SAFETY: addr is initialised and the size matches its type.
            let ret = unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Error::from_acquire_errno(io::Error::last_os_error(), name));
            }

            let link_type = bound_link_type(&socket).unwrap_or(LinkType::Ethernet);
            info!(
                interface = %name,
                ifindex,
                ?link_type,
                frame_size = geometry.frame_size,
                frames = geometry.frame_nr,
                "Packet ring opened"
            );

            Ok(Self {
                interface: config.interface.clone(),
                ring: Some(ring),
                socket: Some(socket),
                link_type,
                read_timeout: config.read_timeout,
                next_slot: 0,
                stats: StatsAccumulator::new(),
            })
        }

        /// Copy the frame in the current slot out, if the kernel filled it
        fn take_ready(&mut self) -> Option<RawFrame> {
            let ring = self.ring.as_ref()?;
            let frame_size = ring.geometry.frame_size as usize;
            let frame_nr = ring.geometry.frame_nr;
            let hdr = ring.slot(self.next_slot);

            // SAFETY: hdr points at a slot header inside the mapping. The
            // kernel hands the slot over by setting TP_STATUS_USER; the
            // fence orders our reads of the slot after that.
            unsafe {
                let status = ptr::read_volatile(ptr::addr_of!((*hdr).tp_status));
                if status & TP_STATUS_USER == 0 {
                    return None;
                }
                fence(Ordering::Acquire);

                let mac = ptr::read_volatile(ptr::addr_of!((*hdr).tp_mac)) as usize;
                let snaplen = ptr::read_volatile(ptr::addr_of!((*hdr).tp_snaplen)) as usize;
                let wire_len = ptr::read_volatile(ptr::addr_of!((*hdr).tp_len)) as usize;
                let sec = ptr::read_volatile(ptr::addr_of!((*hdr).tp_sec));
                let nsec = ptr::read_volatile(ptr::addr_of!((*hdr).tp_nsec));

                let frame = if mac + snaplen <= frame_size {
                    let data = std::slice::from_raw_parts(hdr.cast::<u8>().add(mac), snaplen);
                    Some(
                        RawFrame::new(self.link_type, data.to_vec())
                            .with_wire_len(wire_len)
                            .with_timestamp(
                                UNIX_EPOCH + Duration::new(sec as u64, nsec.min(999_999_999)),
                            ),
                    )
                } else {
                    debug!(mac, snaplen, frame_size, "Ring slot overruns its frame");
                    None
                };

                fence(Ordering::Release);
                ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_KERNEL);
                self.next_slot = (self.next_slot + 1) % frame_nr;

                frame.or_else(|| self.take_ready())
            }
        }

        /// Hand every filled slot back to the kernel
        fn flush(&mut self) -> usize {
            let mut flushed = 0;
            while self.take_ready().is_some() {
                flushed += 1;
            }
            flushed
        }

        fn refresh_kernel_stats(&self) {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            let mut stats = TpacketStats::default();
            let mut len = mem::size_of::<TpacketStats>() as libc::socklen_t;
            // SAFETY: stats is a writable TpacketStats and len its size.
            let ret = unsafe {
                libc::getsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_PACKET,
                    PACKET_STATISTICS,
                    &mut stats as *mut TpacketStats as *mut libc::c_void,
                    &mut len,
                )
            };
            // The kernel resets the counters on every read
            if ret == 0 {
                self.stats.record_kernel_drops(stats.tp_drops as u64);
            }
        }
    }

    impl CaptureBackend for RingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::RawRing
        }

        fn link_type(&self) -> LinkType {
            self.link_type
        }

        fn install_filter(&mut self, program: &FilterProgram) -> Result<()> {
            let socket = self.socket.as_ref().ok_or(Error::SessionClosed)?;
            if self.link_type != LinkType::Ethernet {
                return Err(Error::FilterInstallFailed(format!(
                    "filters are compiled for Ethernet but '{}' has link type {:?}",
                    self.interface, self.link_type
                )));
            }

            let mut filters = program.to_sock_filters();
            let fprog = libc::sock_fprog {
                len: filters.len() as libc::c_ushort,
                filter: filters.as_mut_ptr(),
            };
            set_option(socket, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &fprog).map_err(
                |e| Error::FilterInstallFailed(format!("SO_ATTACH_FILTER on '{}': {}", self.interface, e)),
            )?;

            // Frames queued before the filter was attached did not pass it
            let flushed = self.flush();
            debug!(
                interface = %self.interface,
                instructions = program.len(),
                flushed,
                "Kernel filter attached"
            );
            Ok(())
        }

        fn read_frame(&mut self) -> Result<FrameRead> {
            let fd = self
                .socket
                .as_ref()
                .ok_or(Error::SessionClosed)?
                .as_raw_fd();
            let deadline = Instant::now() + self.read_timeout;

            loop {
                if let Some(frame) = self.take_ready() {
                    self.stats.record_frame(frame.len());
                    return Ok(FrameRead::Frame(frame));
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.refresh_kernel_stats();
                    return Ok(FrameRead::TimedOut);
                }

                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN | libc::POLLERR,
                    revents: 0,
                };
                let timeout_ms = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
                // SAFETY: pfd is a single valid pollfd.
                let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!(interface = %self.interface, error = %err, "Ring poll failed");
                    return Err(Error::Io(err));
                }
                if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Err(Error::capture(format!(
                        "socket error on '{}' (revents {:#x})",
                        self.interface, pfd.revents
                    )));
                }
            }
        }

        fn close(&mut self) {
            self.refresh_kernel_stats();
            self.ring.take();
            if self.socket.take().is_some() {
                info!(interface = %self.interface, "Packet ring closed");
            }
        }

        fn is_closed(&self) -> bool {
            self.socket.is_none()
        }

        fn stats(&self) -> CaptureStats {
            self.stats.snapshot()
        }
    }

    impl Drop for RingBackend {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn set_option<T>(
        socket: &PacketSocket,
        level: libc::c_int,
        name: libc::c_int,
        value: &T,
    ) -> io::Result<()> {
        // SAFETY: value points at a live T and the length is its size.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Link type of the interface the socket is bound to
    fn bound_link_type(socket: &PacketSocket) -> Option<LinkType> {
        // SAFETY: sockaddr_ll is plain old data; getsockname fills at most len bytes.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                socket.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return None;
        }
        Some(match addr.sll_hatype {
            ARPHRD_ETHER | ARPHRD_LOOPBACK => LinkType::Ethernet,
            ARPHRD_NONE => LinkType::RawIp,
            other => LinkType::Other(other as i32),
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::backend::{CaptureBackend, FrameRead};
    use crate::bpf::FilterProgram;
    use crate::stats::CaptureStats;
    use sniwatch_core::{BackendKind, CaptureConfig, Error, LinkType, Result};
    use std::convert::Infallible;

    /// Placeholder on platforms without AF_PACKET; cannot be constructed
    pub struct RingBackend {
        never: Infallible,
    }

    impl RingBackend {
        pub fn is_supported() -> bool {
            false
        }

        pub fn open(_config: &CaptureConfig, _ifindex: u32) -> Result<Self> {
            Err(Error::UnsupportedBackend(format!(
                "{} requires Linux",
                BackendKind::RawRing
            )))
        }
    }

    impl CaptureBackend for RingBackend {
        fn kind(&self) -> BackendKind {
            match self.never {}
        }

        fn link_type(&self) -> LinkType {
            match self.never {}
        }

        fn install_filter(&mut self, _program: &FilterProgram) -> Result<()> {
            match self.never {}
        }

        fn read_frame(&mut self) -> Result<FrameRead> {
            match self.never {}
        }

        fn close(&mut self) {
            match self.never {}
        }

        fn is_closed(&self) -> bool {
            match self.never {}
        }

        fn stats(&self) -> CaptureStats {
            match self.never {}
        }
    }
}
