use dns_shield::ffi::{ShieldCallbacks, ShieldConfig, ShieldLogSink, ShieldStats};
use dns_shield::{
    ShieldEnginePublishBlocklist, ShieldEngineGetStats, ShieldEngineStart, ShieldEngineStop,
    ShieldFreeEngine, ShieldNewEngine, ShieldSetBreadcrumbMask, ShieldSetLogSink,
};
use libc::{self, c_char, c_void};
use std::env;
use std::ffi::{CStr, CString};
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::path::PathBuf;
use std::ptr;

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    eprintln!(
        "[standalone] launching dns-shield (if={}, upstream={}, mtu={})",
        settings.ifname, settings.upstream, settings.mtu
    );

    install_log_sink(settings.verbose);

    let tun = TunDevice::open(&settings.ifname)?;
    let defaults = ShieldConfig::default();
    let server = Ipv4Addr::from(defaults.dns_server);
    let client = Ipv4Addr::from(defaults.client_addr);
    println!(
        "[standalone] created interface {name}. Configure it (as root) via:\n  ip addr add {client}/{prefix} dev {name}\n  ip link set {name} up\nthen point a resolver at {server}, e.g. `dig @{server} example.com`.",
        name = tun.name,
        prefix = defaults.client_prefix,
    );

    let callbacks = ShieldCallbacks::default();
    let engine = unsafe { ShieldNewEngine(&callbacks) };
    if engine.is_null() {
        anyhow::bail!("ShieldNewEngine returned null");
    }

    if let Some(path) = &settings.blocklist {
        let domains = load_blocklist(path)?;
        let pointers: Vec<*const c_char> = domains.iter().map(|d| d.as_ptr()).collect();
        unsafe {
            ShieldEnginePublishBlocklist(engine, pointers.as_ptr(), pointers.len(), false);
        }
        println!("[standalone] published {} blocklist entries", domains.len());
    }

    let config = ShieldConfig {
        upstream_addr: settings.upstream.octets(),
        mtu: settings.mtu,
        ..defaults
    };
    let status = unsafe { ShieldEngineStart(engine, tun.fd.into_raw_fd(), &config) };
    if status != 0 {
        unsafe { ShieldFreeEngine(engine) };
        anyhow::bail!("ShieldEngineStart failed with status {}", status);
    }

    println!("[standalone] engine running. Press Enter to stop.");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let mut stats = ShieldStats::default();
    unsafe {
        ShieldEngineGetStats(engine, &mut stats);
        ShieldEngineStop(engine);
        ShieldFreeEngine(engine);
    }
    println!(
        "[standalone] stopped: {} queries, {} blocked, {} cache hits, {} forwarded, {} upstream failures",
        stats.queries, stats.blocked, stats.cache_hits, stats.forwarded, stats.upstream_failures
    );
    Ok(())
}

#[derive(Debug)]
struct Settings {
    ifname: String,
    upstream: Ipv4Addr,
    mtu: u32,
    blocklist: Option<PathBuf>,
    verbose: bool,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut settings = Settings {
            ifname: "shield0".to_string(),
            upstream: Ipv4Addr::new(1, 1, 1, 1),
            mtu: 1500,
            blocklist: None,
            verbose: false,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
            };
            match arg.as_str() {
                "--name" => settings.ifname = value("--name")?,
                "--upstream" => {
                    settings.upstream = value("--upstream")?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid upstream address"))?;
                }
                "--mtu" => {
                    settings.mtu = value("--mtu")?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                }
                "--blocklist" => settings.blocklist = Some(PathBuf::from(value("--blocklist")?)),
                "--verbose" => settings.verbose = true,
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --name <ifname>, --upstream <ipv4>, --mtu <value>, --blocklist <file>, --verbose",
                        arg
                    );
                }
            }
        }
        Ok(settings)
    }
}

/// One domain per line; blank lines and `#` comments are skipped by the engine.
fn load_blocklist(path: &PathBuf) -> anyhow::Result<Vec<CString>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("reading {}: {err}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| CString::new(line).ok())
        .collect())
}

struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    fn open(name: &str) -> io::Result<Self> {
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "standalone runner currently supports only Linux",
            ));
        }

        #[cfg(target_os = "linux")]
        {
            use std::os::fd::{AsRawFd, FromRawFd};

            const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
            const IFF_TUN: libc::c_short = 0x0001;
            const IFF_NO_PI: libc::c_short = 0x1000;

            #[repr(C)]
            struct IfReq {
                name: [c_char; libc::IFNAMSIZ],
                flags: libc::c_short,
                _pad: [u8; 22],
            }

            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "interface name must be 1-15 bytes",
                ));
            }

            let path = b"/dev/net/tun\0";
            let fd = unsafe {
                libc::open(path.as_ptr().cast(), libc::O_RDWR | libc::O_CLOEXEC)
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };

            let mut request = IfReq {
                name: [0; libc::IFNAMSIZ],
                flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            for (slot, byte) in request.name.iter_mut().zip(name.as_bytes()) {
                *slot = *byte as c_char;
            }
            let status = unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF as _, &mut request) };
            if status < 0 {
                return Err(io::Error::last_os_error());
            }

            let name = unsafe { CStr::from_ptr(request.name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            Ok(Self { fd: owned, name })
        }
    }
}

fn install_log_sink(verbose: bool) {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        println!("[engine][{level}] {entry}");
    }

    let mask = if verbose { u32::MAX } else { 0 };
    let sink = ShieldLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: mask,
    };
    let level: &[u8] = if verbose { b"debug\0" } else { b"info\0" };
    unsafe {
        ShieldSetLogSink(&sink, level.as_ptr().cast(), ptr::null_mut());
        ShieldSetBreadcrumbMask(mask);
    }
}
