//! Platform glue: raw-socket ports and tun-device control behind small
//! traits, so the core logic never depends on a real network stack.

use std::io;
use std::net::Ipv4Addr;

/// A byte-oriented, promiscuous-capable port. Physical interfaces are
/// backed by an AF_PACKET socket; the tunnel is backed by a `/dev/net/tun`
/// file descriptor.
pub trait RawPort: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

/// The platform call the Maintainer uses to publish a learned client
/// address onto the tunnel device.
pub trait TunController: Send + Sync {
    fn configure_ipv4(&self, ifname: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()>;
}

/// An in-memory double used by unit tests and by anything that wants to run
/// without root or a real kernel network stack.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockPort {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        outbox: Mutex<Vec<Vec<u8>>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_inbound(&self, frame: Vec<u8>) {
            self.inbox.lock().unwrap().push_back(frame);
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.outbox.lock().unwrap().clone()
        }
    }

    impl RawPort for MockPort {
        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbox.lock().unwrap().pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame queued")),
            }
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.outbox.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    #[derive(Default)]
    pub struct MockTunController {
        pub configured: Mutex<Vec<(String, Ipv4Addr, Ipv4Addr)>>,
    }

    impl MockTunController {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl TunController for MockTunController {
        fn configure_ipv4(&self, ifname: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
            self.configured.lock().unwrap().push((ifname.to_string(), addr, netmask));
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    //! Real AF_PACKET / tun-device glue. The ioctl sequence below mirrors
    //! the historical `raw_open`/`tun_alloc`/`tun_ipv4_config` helpers:
    //! `SIOCGIFINDEX` + `bind(2)` to attach the packet socket to an
    //! interface, `SIOCGIFHWADDR` to read back its MAC, `SIOCGIFFLAGS`/
    //! `SIOCSIFFLAGS` to set `IFF_PROMISC` or bring a device up, and
    //! `TUNSETIFF`/`SIOCSIFADDR`/`SIOCSIFNETMASK` for the tunnel device.

    use super::*;
    use std::ffi::{CStr, CString};
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    // Not exposed by the `libc` crate: computed the same way as
    // `_IOW('T', 202, int)` in <linux/if_tun.h>.
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;

    fn copy_ifname(dst: &mut [libc::c_char], ifname: &CStr) {
        let bytes = ifname.to_bytes_with_nul();
        let n = bytes.len().min(dst.len());
        for (d, s) in dst.iter_mut().zip(bytes.iter()).take(n) {
            *d = *s as libc::c_char;
        }
    }

    #[repr(C)]
    struct IfReqIndex {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_ifindex: libc::c_int,
    }

    #[repr(C)]
    struct IfReqHwaddr {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_hwaddr: libc::sockaddr,
    }

    #[repr(C)]
    struct IfReqFlags {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
    }

    #[repr(C)]
    struct IfReqAddr {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_addr: libc::sockaddr_in,
    }

    fn ifindex(fd: RawFd, ifname: &CStr) -> io::Result<libc::c_int> {
        let mut req: IfReqIndex = unsafe { mem::zeroed() };
        copy_ifname(&mut req.ifr_name, ifname);
        if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(req.ifr_ifindex)
    }

    fn hwaddr(fd: RawFd, ifname: &CStr) -> io::Result<[u8; 6]> {
        let mut req: IfReqHwaddr = unsafe { mem::zeroed() };
        copy_ifname(&mut req.ifr_name, ifname);
        if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut mac = [0u8; 6];
        for (m, b) in mac.iter_mut().zip(req.ifr_hwaddr.sa_data.iter()) {
            *m = *b as u8;
        }
        Ok(mac)
    }

    fn bind_to_interface(fd: RawFd, ifname: &CStr) -> io::Result<()> {
        let index = ifindex(fd, ifname)?;
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = index;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_flags(fd: RawFd, ifname: &CStr, set: libc::c_short) -> io::Result<()> {
        let mut req: IfReqFlags = unsafe { mem::zeroed() };
        copy_ifname(&mut req.ifr_name, ifname);
        if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut req) } < 0 {
            req.ifr_flags = 0;
        }
        req.ifr_flags |= set;
        if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_promiscuous(fd: RawFd, ifname: &CStr) -> io::Result<()> {
        set_flags(fd, ifname, libc::IFF_PROMISC as libc::c_short)
    }

    fn set_addr(fd: RawFd, ifname: &CStr, request: libc::c_ulong, addr: Ipv4Addr) -> io::Result<()> {
        let mut req: IfReqAddr = unsafe { mem::zeroed() };
        copy_ifname(&mut req.ifr_name, ifname);
        req.ifr_addr.sin_family = libc::AF_INET as u16;
        req.ifr_addr.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) };
        if unsafe { libc::ioctl(fd, request, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ifup(fd: RawFd, ifname: &CStr) -> io::Result<()> {
        set_flags(fd, ifname, (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short)
    }

    /// A bound, promiscuous AF_PACKET socket for one physical interface.
    pub struct LinuxPort {
        fd: OwnedFd,
        mac: [u8; 6],
    }

    impl LinuxPort {
        /// Opens a raw socket, binds it to `ifname`, puts the interface into
        /// promiscuous mode, and reads back its hardware address.
        pub fn bind(ifname: &str) -> io::Result<Self> {
            let raw =
                unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ALL as u16).to_be() as i32) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let ifname_c =
                CString::new(ifname).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ifname"))?;
            bind_to_interface(fd.as_raw_fd(), &ifname_c)?;
            set_promiscuous(fd.as_raw_fd(), &ifname_c)?;
            let mac = hwaddr(fd.as_raw_fd(), &ifname_c)?;

            Ok(Self { fd, mac })
        }

        /// The interface's hardware address, as read back via
        /// `SIOCGIFHWADDR` when the socket was bound.
        pub fn hwaddr(&self) -> [u8; 6] {
            self.mac
        }
    }

    impl RawPort for LinuxPort {
        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }

    /// A `/dev/net/tun` point-to-point IP tunnel device, opened with
    /// `IFF_TUN` so reads/writes carry raw IPv4 packets rather than
    /// Ethernet frames.
    pub struct LinuxTunDevice {
        fd: OwnedFd,
    }

    impl LinuxTunDevice {
        pub fn alloc(ifname: &str) -> io::Result<Self> {
            let path = CString::new("/dev/net/tun").unwrap();
            let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let ifname_c =
                CString::new(ifname).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ifname"))?;
            let mut req: IfReqFlags = unsafe { mem::zeroed() };
            copy_ifname(&mut req.ifr_name, &ifname_c);
            req.ifr_flags = IFF_TUN;
            if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut req) } < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self { fd })
        }
    }

    impl RawPort for LinuxTunDevice {
        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }

    /// Configures the tunnel device's IPv4 address via a throwaway
    /// `AF_INET`/`SOCK_DGRAM` control socket, independent of the tunnel's
    /// own file descriptor.
    pub struct LinuxTun;

    impl TunController for LinuxTun {
        fn configure_ipv4(&self, ifname: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
            let ifname_c =
                CString::new(ifname).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ifname"))?;

            let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            let sock = unsafe { OwnedFd::from_raw_fd(raw) };
            let fd = sock.as_raw_fd();

            set_addr(fd, &ifname_c, libc::SIOCSIFADDR, addr)?;
            set_addr(fd, &ifname_c, libc::SIOCSIFNETMASK, netmask)?;
            ifup(fd, &ifname_c)?;
            Ok(())
        }
    }
}
