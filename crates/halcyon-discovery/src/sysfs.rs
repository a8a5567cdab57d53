//! USB and PCI probing from sysfs
//!
//! Walks `<root>/bus/{usb,pci}/devices`, reads device attributes into
//! temporary devices and hands them out as probe requests. Every attribute is
//! parsed into a typed value; a malformed optional attribute is logged and
//! skipped, a malformed identity attribute fails the device.

use halcyon_core::{DeviceStore, PropertyValue, TemporaryDevice};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coordinator::ProbeRequest;
use crate::identity::SYSFS_PATH_KEY;
use crate::parent::PropertyMatch;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot parse {attribute} value {value:?}: {reason}")]
pub struct ParseError {
    pub attribute: String,
    pub value: String,
    pub reason: String,
}

impl ParseError {
    fn new(attribute: &str, value: &str, reason: impl Display) -> Self {
        Self {
            attribute: attribute.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SysfsError {
    #[error("IO error at {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{} has no {attribute} attribute", path.display())]
    MissingAttribute { path: PathBuf, attribute: String },
    #[error("{path} is not a {bus} device", path = .0.display(), bus = .1)]
    NotADevice(PathBuf, Bus),
}

/// Buses this prober understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Usb,
    Pci,
}

impl Bus {
    pub fn name(self) -> &'static str {
        match self {
            Bus::Usb => "usb",
            Bus::Pci => "pci",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "usb" => Some(Bus::Usb),
            "pci" => Some(Bus::Pci),
            _ => None,
        }
    }
}

impl std::fmt::Display for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a hex attribute such as `0781` or `0x8086`
pub fn parse_hex(attribute: &str, raw: &str) -> Result<i32, ParseError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    i32::from_str_radix(digits, 16).map_err(|e| ParseError::new(attribute, raw, e))
}

pub fn parse_decimal<T>(attribute: &str, raw: &str) -> Result<T, ParseError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ParseError::new(attribute, raw, e))
}

/// Parse a `major.minor` version such as ` 2.00` into its BCD encoding
/// (`0x0200`)
pub fn parse_bcd_version(attribute: &str, raw: &str) -> Result<i32, ParseError> {
    let trimmed = raw.trim();
    let (major, minor) = trimmed
        .split_once('.')
        .ok_or_else(|| ParseError::new(attribute, raw, "expected major.minor"))?;
    if major.is_empty()
        || minor.len() > 2
        || !major.chars().chain(minor.chars()).all(|c| c.is_ascii_digit())
    {
        return Err(ParseError::new(attribute, raw, "not a BCD version"));
    }
    let digits = format!("{}{:0<2}", major, minor);
    i32::from_str_radix(&digits, 16).map_err(|e| ParseError::new(attribute, raw, e))
}

/// Read one attribute file, trimmed. A missing file is `Ok(None)`.
pub fn read_attr(dir: &Path, name: &str) -> Result<Option<String>, SysfsError> {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SysfsError::IoError { path, source }),
    }
}

fn require_attr(dir: &Path, name: &str) -> Result<String, SysfsError> {
    read_attr(dir, name)?.ok_or_else(|| SysfsError::MissingAttribute {
        path: dir.to_path_buf(),
        attribute: name.to_string(),
    })
}

/// Read and parse an optional attribute, logging and dropping bad values
fn optional_attr<T>(
    dir: &Path,
    name: &str,
    parse: impl Fn(&str, &str) -> Result<T, ParseError>,
) -> Option<T> {
    match read_attr(dir, name) {
        Ok(Some(raw)) => match parse(name, &raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Ignoring malformed attribute");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Cannot read attribute");
            None
        }
    }
}

/// Drop the last path component. `None` for `/` and single-component paths.
pub fn parent_sysfs_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(trimmed[..idx].to_string())
}

fn is_usb_device(dir: &Path) -> bool {
    dir.join("idVendor").is_file()
}

fn is_pci_device(dir: &Path) -> bool {
    dir.join("vendor").is_file() && dir.join("device").is_file()
}

/// Split a USB bus id (`usb2`, `1-4`, `1-4.3`) into bus and port numbers
fn parse_usb_bus_id(bus_id: &str) -> Option<(i32, Option<i32>)> {
    if bus_id.contains(':') {
        return None;
    }
    if let Some(bus) = bus_id.strip_prefix("usb") {
        return bus.parse().ok().map(|bus| (bus, None));
    }
    let (bus, ports) = bus_id.split_once('-')?;
    let port = ports.rsplit('.').next()?.parse().ok()?;
    Some((bus.parse().ok()?, Some(port)))
}

fn usb_class_capabilities(class: i32, subclass: i32, protocol: i32) -> (Option<&'static str>, Vec<&'static str>) {
    match (class, subclass, protocol) {
        (0x01, _, _) => (Some("multimedia.audio"), vec!["multimedia.audio"]),
        (0x02, 0x06, _) => (Some("net"), vec!["net", "net.ethernet"]),
        (0x02, 0x02, 0x01) => (Some("modem"), vec!["modem"]),
        (0x03, 0x00 | 0x01, 0x01) => (Some("input.keyboard"), vec!["input", "input.keyboard"]),
        (0x03, 0x00 | 0x01, 0x02) => (Some("input.mouse"), vec!["input", "input.mouse"]),
        (0x03, _, _) => (Some("input"), vec!["input"]),
        (0x07, _, _) => (Some("printer"), vec!["printer"]),
        (0x08, _, _) => (Some("storage"), vec!["storage"]),
        (0x09, _, _) => (Some("usb_hub"), vec!["usb_hub"]),
        _ => (None, Vec::new()),
    }
}

fn pci_class_capabilities(class: i32, subclass: i32) -> (Option<&'static str>, Vec<&'static str>) {
    match (class, subclass) {
        (0x01, _) => (Some("storage_controller"), vec!["storage_controller"]),
        (0x02, _) => (Some("net"), vec!["net"]),
        (0x03, _) => (Some("video"), vec!["video"]),
        (0x04, _) => (Some("multimedia"), vec!["multimedia"]),
        (0x06, 0x04) => (Some("bridge"), vec!["bridge"]),
        (0x0c, 0x03) => (Some("usb_host"), vec!["usb_host"]),
        _ => (None, Vec::new()),
    }
}

fn set(temp: &mut TemporaryDevice, key: &str, value: impl Into<PropertyValue>) {
    if let Err(e) = temp.set_property(key, value) {
        warn!(temp = temp.id(), error = %e, "Cannot set probed property");
    }
}

/// Probes USB and PCI devices under a sysfs mount
#[derive(Debug, Clone)]
pub struct SysfsProber {
    root: PathBuf,
}

impl SysfsProber {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Probe every device on `buses`. Failures are logged and skipped.
    pub fn enumerate(&self, store: &DeviceStore, buses: &[Bus]) -> Vec<ProbeRequest> {
        let mut requests = Vec::new();
        for &bus in buses {
            match self.enumerate_bus(store, bus) {
                Ok(mut found) => {
                    info!(bus = %bus, count = found.len(), "Enumerated bus");
                    requests.append(&mut found);
                }
                Err(e) => warn!(bus = %bus, error = %e, "Cannot enumerate bus"),
            }
        }
        requests
    }

    /// Probe every device listed under `<root>/bus/<bus>/devices`
    pub fn enumerate_bus(&self, store: &DeviceStore, bus: Bus) -> Result<Vec<ProbeRequest>, SysfsError> {
        let dir = self.root.join("bus").join(bus.name()).join("devices");
        let entries = std::fs::read_dir(&dir).map_err(|source| SysfsError::IoError {
            path: dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        // Shallow paths first so parents tend to be committed before children
        paths.sort_by_key(|p| {
            let depth = std::fs::canonicalize(p)
                .map(|c| c.components().count())
                .unwrap_or(usize::MAX);
            (depth, p.clone())
        });

        let mut requests = Vec::new();
        for path in paths {
            match self.probe_path(store, bus, &path) {
                Ok(request) => requests.push(request),
                Err(SysfsError::NotADevice(path, _)) => {
                    debug!(path = %path.display(), "Skipping non-device entry");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to probe device"),
            }
        }
        Ok(requests)
    }

    /// Probe the device at `path`, which may be a symlink
    pub fn probe_path(&self, store: &DeviceStore, bus: Bus, path: &Path) -> Result<ProbeRequest, SysfsError> {
        let dir = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        match bus {
            Bus::Usb => self.probe_usb(store, &dir),
            Bus::Pci => self.probe_pci(store, &dir),
        }
    }

    fn parent_lookup(&self, dir: &Path) -> Option<PropertyMatch> {
        let parent = parent_sysfs_path(&dir.to_string_lossy())?;
        let parent_dir = Path::new(&parent);
        if is_usb_device(parent_dir) || is_pci_device(parent_dir) {
            Some(PropertyMatch::sysfs_path(parent))
        } else {
            None
        }
    }

    fn probe_usb(&self, store: &DeviceStore, dir: &Path) -> Result<ProbeRequest, SysfsError> {
        if !is_usb_device(dir) {
            return Err(SysfsError::NotADevice(dir.to_path_buf(), Bus::Usb));
        }
        let vendor_id = parse_hex("idVendor", &require_attr(dir, "idVendor")?)?;
        let product_id = parse_hex("idProduct", &require_attr(dir, "idProduct")?)?;
        let revision = parse_hex("bcdDevice", &require_attr(dir, "bcdDevice")?)?;

        let mut temp = store.create_temporary();
        set(&mut temp, "info.bus", "usb");
        set(&mut temp, SYSFS_PATH_KEY, dir.to_string_lossy().into_owned());
        set(&mut temp, "usb.vendor_id", vendor_id);
        set(&mut temp, "usb.product_id", product_id);
        set(&mut temp, "usb.device_revision_bcd", revision);
        temp.add_capability("usb_device");

        match read_attr(dir, "serial")? {
            Some(serial) if !serial.is_empty() => set(&mut temp, "usb.serial", serial),
            _ => {}
        }

        let bus_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some((bus_number, port)) = parse_usb_bus_id(&bus_id) {
            set(&mut temp, "usb.bus_number", bus_number);
            if let Some(port) = port {
                set(&mut temp, "usb.port_number", port);
            }
        }
        if let Some(devnum) = optional_attr(dir, "devnum", parse_decimal::<i32>) {
            set(&mut temp, "usb.linux.device_number", devnum);
        }
        if let Some(speed) = optional_attr(dir, "speed", parse_decimal::<f64>) {
            set(&mut temp, "usb.speed", speed);
        }
        if let Some(version) = optional_attr(dir, "version", parse_decimal::<f64>) {
            set(&mut temp, "usb.version", version);
        }
        if let Some(bcd) = optional_attr(dir, "version", parse_bcd_version) {
            set(&mut temp, "usb.version_bcd", bcd);
        }
        if let Some(power) = optional_attr(dir, "bMaxPower", |name, raw| {
            parse_decimal::<i32>(name, raw.trim_end_matches("mA"))
        }) {
            set(&mut temp, "usb.max_power", power);
        }
        if let Some(attributes) = optional_attr(dir, "bmAttributes", parse_hex) {
            set(&mut temp, "usb.is_self_powered", attributes & 0x40 != 0);
            set(&mut temp, "usb.can_wake_up", attributes & 0x20 != 0);
        }
        if let Some(n) = optional_attr(dir, "bNumConfigurations", parse_decimal::<i32>) {
            set(&mut temp, "usb.num_configurations", n);
        }

        let class = optional_attr(dir, "bDeviceClass", parse_hex).unwrap_or(0);
        let subclass = optional_attr(dir, "bDeviceSubClass", parse_hex).unwrap_or(0);
        let protocol = optional_attr(dir, "bDeviceProtocol", parse_hex).unwrap_or(0);
        set(&mut temp, "usb.device_class", class);
        set(&mut temp, "usb.device_subclass", subclass);
        set(&mut temp, "usb.device_protocol", protocol);
        let (category, capabilities) = usb_class_capabilities(class, subclass, protocol);
        if let Some(category) = category {
            set(&mut temp, "info.category", category);
        }
        for capability in capabilities {
            temp.add_capability(capability);
        }

        let vendor = read_attr(dir, "manufacturer")?
            .unwrap_or_else(|| format!("Unknown (0x{:04x})", vendor_id));
        let product = read_attr(dir, "product")?
            .unwrap_or_else(|| format!("Unknown (0x{:04x})", product_id));
        set(&mut temp, "usb.vendor", vendor.clone());
        set(&mut temp, "info.vendor", vendor);
        set(&mut temp, "usb.product", product.clone());
        set(&mut temp, "info.product", product);

        let mut request = ProbeRequest::new("usb", temp);
        if let Some(lookup) = self.parent_lookup(dir) {
            request = request.with_parent(lookup);
        }
        Ok(request)
    }

    fn probe_pci(&self, store: &DeviceStore, dir: &Path) -> Result<ProbeRequest, SysfsError> {
        if !is_pci_device(dir) {
            return Err(SysfsError::NotADevice(dir.to_path_buf(), Bus::Pci));
        }
        let vendor_id = parse_hex("vendor", &require_attr(dir, "vendor")?)?;
        let product_id = parse_hex("device", &require_attr(dir, "device")?)?;

        let mut temp = store.create_temporary();
        set(&mut temp, "info.bus", "pci");
        set(&mut temp, SYSFS_PATH_KEY, dir.to_string_lossy().into_owned());
        set(&mut temp, "pci.vendor_id", vendor_id);
        set(&mut temp, "pci.product_id", product_id);
        temp.add_capability("pci");

        if let Some(slot) = dir.file_name() {
            set(&mut temp, "pci.linux.slot_name", slot.to_string_lossy().into_owned());
        }
        if let Some(v) = optional_attr(dir, "subsystem_vendor", parse_hex) {
            set(&mut temp, "pci.subsys_vendor_id", v);
        }
        if let Some(v) = optional_attr(dir, "subsystem_device", parse_hex) {
            set(&mut temp, "pci.subsys_product_id", v);
        }
        if let Some(class) = optional_attr(dir, "class", parse_hex) {
            let (base, sub, prog) = ((class >> 16) & 0xff, (class >> 8) & 0xff, class & 0xff);
            set(&mut temp, "pci.device_class", base);
            set(&mut temp, "pci.device_subclass", sub);
            set(&mut temp, "pci.device_protocol", prog);
            let (category, capabilities) = pci_class_capabilities(base, sub);
            if let Some(category) = category {
                set(&mut temp, "info.category", category);
            }
            for capability in capabilities {
                temp.add_capability(capability);
            }
        }
        set(&mut temp, "info.vendor", format!("Unknown (0x{:04x})", vendor_id));
        set(&mut temp, "info.product", format!("Unknown (0x{:04x})", product_id));

        let mut request = ProbeRequest::new("pci", temp);
        if let Some(lookup) = self.parent_lookup(dir) {
            request = request.with_parent(lookup);
        }
        Ok(request)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) const XHCI: &str = "devices/pci0000:00/0000:00:14.0";
    pub(crate) const ROOT_HUB: &str = "devices/pci0000:00/0000:00:14.0/usb1";
    pub(crate) const STICK: &str = "devices/pci0000:00/0000:00:14.0/usb1/1-1";

    fn write_attrs(dir: &Path, attrs: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        for (name, value) in attrs {
            fs::write(dir.join(name), format!("{}\n", value)).unwrap();
        }
    }

    fn link(root: &Path, bus: &str, device: &str) {
        let dir = root.join("bus").join(bus).join("devices");
        fs::create_dir_all(&dir).unwrap();
        let name = Path::new(device).file_name().unwrap();
        std::os::unix::fs::symlink(root.join(device), dir.join(name)).unwrap();
    }

    /// A PCI xHCI controller with a root hub, one memory stick and its interface
    pub(crate) fn fake_sysfs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_attrs(
            &root.join(XHCI),
            &[("vendor", "0x8086"), ("device", "0xa36d"), ("class", "0x0c0330")],
        );
        write_attrs(
            &root.join(ROOT_HUB),
            &[
                ("idVendor", "1d6b"),
                ("idProduct", "0002"),
                ("bcdDevice", "0515"),
                ("bDeviceClass", "09"),
                ("devnum", "1"),
                ("version", " 2.00"),
                ("serial", "0000:00:14.0"),
            ],
        );
        write_attrs(
            &root.join(STICK),
            &[
                ("idVendor", "0781"),
                ("idProduct", "5567"),
                ("bcdDevice", "0100"),
                ("bDeviceClass", "00"),
                ("devnum", "2"),
                ("speed", "480"),
                ("bMaxPower", "200mA"),
                ("bmAttributes", "80"),
                ("product", "Cruzer Blade"),
            ],
        );
        write_attrs(
            &root.join(STICK).join("1-1:1.0"),
            &[("bInterfaceClass", "08")],
        );
        link(root, "pci", XHCI);
        link(root, "usb", ROOT_HUB);
        link(root, "usb", STICK);
        link(root, "usb", &format!("{}/1-1:1.0", STICK));
        tmp
    }

    pub(crate) fn canonical(root: &Path, device: &str) -> String {
        fs::canonicalize(root.join(device))
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_hex("idVendor", "0781\n"), Ok(0x0781));
        assert_eq!(parse_hex("vendor", "0x8086"), Ok(0x8086));
        assert!(parse_hex("idVendor", "").is_err());
        assert!(parse_hex("idVendor", "zz").is_err());
        assert_eq!(parse_decimal::<i32>("devnum", " 12 "), Ok(12));
        assert!(parse_decimal::<i32>("devnum", "twelve").is_err());
        assert_eq!(parse_decimal::<f64>("speed", "1.5"), Ok(1.5));
        assert_eq!(parse_bcd_version("version", " 2.00"), Ok(0x0200));
        assert_eq!(parse_bcd_version("version", "1.1"), Ok(0x0110));
        assert!(parse_bcd_version("version", "2").is_err());
        assert!(parse_bcd_version("version", "2.a0").is_err());
    }

    #[test]
    fn test_parse_error_message() {
        let err = parse_hex("idProduct", "xyz").unwrap_err();
        assert_eq!(err.attribute, "idProduct");
        assert!(err.to_string().starts_with("cannot parse idProduct value \"xyz\""));
    }

    #[test]
    fn test_parent_sysfs_path() {
        assert_eq!(
            parent_sysfs_path("/sys/devices/pci0000:00/usb1/1-1"),
            Some("/sys/devices/pci0000:00/usb1".to_string())
        );
        assert_eq!(parent_sysfs_path("/sys/"), None);
        assert_eq!(parent_sysfs_path("/sys/devices/"), Some("/sys".to_string()));
        assert_eq!(parent_sysfs_path("usb1"), None);
    }

    #[test]
    fn test_usb_bus_id() {
        assert_eq!(parse_usb_bus_id("usb2"), Some((2, None)));
        assert_eq!(parse_usb_bus_id("1-4"), Some((1, Some(4))));
        assert_eq!(parse_usb_bus_id("3-1.4.2"), Some((3, Some(2))));
        assert_eq!(parse_usb_bus_id("1-1:1.0"), None);
    }

    #[test]
    fn test_probe_usb_stick() {
        let sysfs = fake_sysfs();
        let store = DeviceStore::new();
        let prober = SysfsProber::new(sysfs.path());

        let request = prober
            .probe_path(&store, Bus::Usb, &sysfs.path().join(STICK))
            .unwrap();
        assert_eq!(request.bus, "usb");
        let props = request.device.properties();
        assert_eq!(props.get_int("usb.vendor_id"), Some(0x0781));
        assert_eq!(props.get_int("usb.product_id"), Some(0x5567));
        assert_eq!(props.get_int("usb.device_revision_bcd"), Some(0x0100));
        assert_eq!(props.get_int("usb.bus_number"), Some(1));
        assert_eq!(props.get_int("usb.port_number"), Some(1));
        assert_eq!(props.get_int("usb.linux.device_number"), Some(2));
        assert_eq!(props.get_int("usb.max_power"), Some(200));
        assert_eq!(props.get_bool("usb.is_self_powered"), Some(false));
        assert_eq!(props.get_double("usb.speed"), Some(480.0));
        assert_eq!(props.get_string("info.product"), Some("Cruzer Blade"));
        assert_eq!(props.get_string("info.vendor"), Some("Unknown (0x0781)"));
        assert!(props.get_string("usb.serial").is_none());
        assert_eq!(
            props.get_string(SYSFS_PATH_KEY),
            Some(canonical(sysfs.path(), STICK).as_str())
        );
        assert_eq!(
            request.parent,
            Some(PropertyMatch::sysfs_path(canonical(sysfs.path(), ROOT_HUB)))
        );
    }

    #[test]
    fn test_root_hub_capabilities() {
        let sysfs = fake_sysfs();
        let store = DeviceStore::new();
        let request = SysfsProber::new(sysfs.path())
            .probe_path(&store, Bus::Usb, &sysfs.path().join(ROOT_HUB))
            .unwrap();
        let props = request.device.properties();
        assert!(request.device.capabilities().contains("usb_hub"));
        assert_eq!(props.get_string("info.category"), Some("usb_hub"));
        assert_eq!(props.get_string("usb.serial"), Some("0000:00:14.0"));
        assert_eq!(props.get_int("usb.version_bcd"), Some(0x0200));
        assert!(props.get_int("usb.port_number").is_none());
        assert_eq!(
            request.parent,
            Some(PropertyMatch::sysfs_path(canonical(sysfs.path(), XHCI)))
        );
    }

    #[test]
    fn test_malformed_optional_attribute_is_skipped() {
        let sysfs = fake_sysfs();
        fs::write(sysfs.path().join(STICK).join("speed"), "fast\n").unwrap();
        let store = DeviceStore::new();
        let request = SysfsProber::new(sysfs.path())
            .probe_path(&store, Bus::Usb, &sysfs.path().join(STICK))
            .unwrap();
        assert!(request.device.properties().get_double("usb.speed").is_none());
        assert_eq!(request.device.properties().get_int("usb.vendor_id"), Some(0x0781));
    }

    #[test]
    fn test_malformed_identity_attribute_fails() {
        let sysfs = fake_sysfs();
        fs::write(sysfs.path().join(STICK).join("idProduct"), "55g7\n").unwrap();
        let store = DeviceStore::new();
        let result = SysfsProber::new(sysfs.path()).probe_path(&store, Bus::Usb, &sysfs.path().join(STICK));
        assert!(matches!(result, Err(SysfsError::Parse(e)) if e.attribute == "idProduct"));
    }

    #[test]
    fn test_probe_pci() {
        let sysfs = fake_sysfs();
        let store = DeviceStore::new();
        let request = SysfsProber::new(sysfs.path())
            .probe_path(&store, Bus::Pci, &sysfs.path().join(XHCI))
            .unwrap();
        let props = request.device.properties();
        assert_eq!(props.get_int("pci.vendor_id"), Some(0x8086));
        assert_eq!(props.get_int("pci.product_id"), Some(0xa36d));
        assert_eq!(props.get_int("pci.device_class"), Some(0x0c));
        assert_eq!(props.get_int("pci.device_subclass"), Some(0x03));
        assert!(request.device.capabilities().contains("usb_host"));
        assert!(request.parent.is_none());
    }

    #[test]
    fn test_enumerate_skips_interfaces() {
        let sysfs = fake_sysfs();
        let store = DeviceStore::new();
        let requests = SysfsProber::new(sysfs.path()).enumerate(&store, &[Bus::Pci, Bus::Usb]);
        let buses: Vec<&str> = requests.iter().map(|r| r.bus.as_str()).collect();
        assert_eq!(buses, vec!["pci", "usb", "usb"]);
        assert_eq!(
            requests[1].device.properties().get_int("usb.product_id"),
            Some(0x0002)
        );
    }

    #[test]
    fn test_wrong_bus_is_rejected() {
        let sysfs = fake_sysfs();
        let store = DeviceStore::new();
        let prober = SysfsProber::new(sysfs.path());

        let err = prober
            .probe_path(&store, Bus::Usb, &sysfs.path().join(XHCI))
            .unwrap_err();
        assert!(matches!(err, SysfsError::NotADevice(_, Bus::Usb)));
        assert!(err.to_string().ends_with("0000:00:14.0 is not a usb device"));
    }

    #[test]
    fn test_missing_bus_directory() {
        let tmp = TempDir::new().unwrap();
        let store = DeviceStore::new();
        let prober = SysfsProber::new(tmp.path());
        assert!(matches!(
            prober.enumerate_bus(&store, Bus::Usb),
            Err(SysfsError::IoError { .. })
        ));
        assert!(prober.enumerate(&store, &[Bus::Usb]).is_empty());
    }
}
