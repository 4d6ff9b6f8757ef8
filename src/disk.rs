use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::Address;
use crate::errors::{DomainError, Result};
use crate::tree::{take_token, XmlNode, XmlValue};

/// Storage backend of a disk, from the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    File,
    Block,
    Dir,
    Network,
    Volume,
    Nvme,
    Vhostuser,
}

impl DiskKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "file" => Some(DiskKind::File),
            "block" => Some(DiskKind::Block),
            "dir" => Some(DiskKind::Dir),
            "network" => Some(DiskKind::Network),
            "volume" => Some(DiskKind::Volume),
            "nvme" => Some(DiskKind::Nvme),
            "vhostuser" => Some(DiskKind::Vhostuser),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            DiskKind::File => "file",
            DiskKind::Block => "block",
            DiskKind::Dir => "dir",
            DiskKind::Network => "network",
            DiskKind::Volume => "volume",
            DiskKind::Nvme => "nvme",
            DiskKind::Vhostuser => "vhostuser",
        }
    }
}

/// How the guest sees the disk, from the `device` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

impl DiskRole {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "disk" => Some(DiskRole::Disk),
            "cdrom" => Some(DiskRole::Cdrom),
            "floppy" => Some(DiskRole::Floppy),
            "lun" => Some(DiskRole::Lun),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            DiskRole::Disk => "disk",
            DiskRole::Cdrom => "cdrom",
            DiskRole::Floppy => "floppy",
            DiskRole::Lun => "lun",
        }
    }
}

/// The three source shapes the model understands, each keyed by a different
/// attribute name on the `source` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DiskSourcePath {
    File(String),
    Block(String),
    Dir(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSource {
    pub path: DiskSourcePath,
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverName {
    Qemu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverFormat {
    Raw,
    Bochs,
    Qcow2,
    Qed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    Stop,
    Report,
    Ignore,
    Enospace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    Threads,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardMode {
    Trim,
    Unmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectZeroes {
    Off,
    On,
    Unmap,
}

/// The qemu driver tunables the model carries. All independently optional;
/// `iothread` and `metadata_cache` are not modeled and are rejected on encode
/// so saving through the typed model cannot silently lose them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskDriver {
    pub name: Option<DriverName>,
    pub format: Option<DriverFormat>,
    pub cache: Option<CacheMode>,
    pub error_policy: Option<ErrorPolicy>,
    pub io: Option<IoMode>,
    pub ioeventfd: Option<bool>,
    pub event_idx: Option<bool>,
    pub copy_on_read: Option<bool>,
    pub discard: Option<DiscardMode>,
    pub detect_zeroes: Option<DetectZeroes>,
    pub queues: Option<u32>,
    pub queue_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetBus {
    Ide,
    Scsi,
    Virtio,
    Xen,
    Usb,
    Sata,
    Sd,
}

impl TargetBus {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "ide" => Some(TargetBus::Ide),
            "scsi" => Some(TargetBus::Scsi),
            "virtio" => Some(TargetBus::Virtio),
            "xen" => Some(TargetBus::Xen),
            "usb" => Some(TargetBus::Usb),
            "sata" => Some(TargetBus::Sata),
            "sd" => Some(TargetBus::Sd),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            TargetBus::Ide => "ide",
            TargetBus::Scsi => "scsi",
            TargetBus::Virtio => "virtio",
            TargetBus::Xen => "xen",
            TargetBus::Usb => "usb",
            TargetBus::Sata => "sata",
            TargetBus::Sd => "sd",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTarget {
    pub dev: Option<String>,
    pub bus: Option<TargetBus>,
    /// `open`/`closed` on cdrom and floppy trays.
    pub tray: Option<bool>,
    /// `on`/`off` for removable USB/SCSI media.
    pub removable: Option<bool>,
    pub rotation_rate: Option<u32>,
}

/// One `<disk>` element. Fields the codec does not understand stay in `rest`
/// and are merged back verbatim on encode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    pub kind: Option<DiskKind>,
    pub role: Option<DiskRole>,
    pub source: Option<DiskSource>,
    pub driver: Option<DiskDriver>,
    pub target: Option<DiskTarget>,
    pub address: Option<Address>,
    pub alias: Option<String>,
    pub boot_order: Option<u32>,
    pub readonly: bool,
    pub shareable: bool,
    /// An empty `<backingStore/>` stub marking the end of a backing chain.
    /// Chains with content are not modeled and are rejected on encode.
    pub backing_store: bool,
    pub rest: XmlNode,
}

impl Disk {
    pub fn decode(mut node: XmlNode) -> Disk {
        let mut disk = Disk::default();

        disk.kind = take_token(&mut node, "type", DiskKind::from_token);
        disk.role = take_token(&mut node, "device", DiskRole::from_token);

        if let Some(source) = node.child_node_mut("source") {
            let path = if let Some(file) = source.take_attr("file") {
                Some(DiskSourcePath::File(file))
            } else if let Some(dev) = source.take_attr("block") {
                Some(DiskSourcePath::Block(dev))
            } else if let Some(dir) = source.take_attr("dir") {
                Some(DiskSourcePath::Dir(dir))
            } else {
                None
            };
            if let Some(path) = path {
                let index = source.take_attr_u32("index");
                disk.source = Some(DiskSource { path, index });
            }
            node.prune_child("source");
        }

        if let Some(alias) = node.child_node_mut("alias") {
            disk.alias = alias.take_attr("name");
            node.prune_child("alias");
        }

        if let Some(driver) = node.child_node_mut("driver") {
            let mut d = DiskDriver::default();
            d.name = take_token(driver, "name", |t| match t {
                "qemu" => Some(DriverName::Qemu),
                _ => None,
            });
            d.format = take_token(driver, "type", |t| match t {
                "raw" => Some(DriverFormat::Raw),
                "bochs" => Some(DriverFormat::Bochs),
                "qcow2" => Some(DriverFormat::Qcow2),
                "qed" => Some(DriverFormat::Qed),
                _ => None,
            });
            d.cache = take_token(driver, "cache", |t| match t {
                "default" => Some(CacheMode::Default),
                "none" => Some(CacheMode::None),
                "writethrough" => Some(CacheMode::Writethrough),
                "writeback" => Some(CacheMode::Writeback),
                "directsync" => Some(CacheMode::Directsync),
                "unsafe" => Some(CacheMode::Unsafe),
                _ => None,
            });
            d.error_policy = take_token(driver, "error_policy", |t| match t {
                "stop" => Some(ErrorPolicy::Stop),
                "report" => Some(ErrorPolicy::Report),
                "ignore" => Some(ErrorPolicy::Ignore),
                "enospace" => Some(ErrorPolicy::Enospace),
                _ => None,
            });
            d.io = take_token(driver, "io", |t| match t {
                "threads" => Some(IoMode::Threads),
                "native" => Some(IoMode::Native),
                _ => None,
            });
            d.ioeventfd = driver.take_attr_flag("ioeventfd", "on", "off");
            d.event_idx = driver.take_attr_flag("event_idx", "on", "off");
            d.copy_on_read = driver.take_attr_flag("copy_on_read", "on", "off");
            d.discard = take_token(driver, "discard", |t| match t {
                "trim" => Some(DiscardMode::Trim),
                "unmap" => Some(DiscardMode::Unmap),
                _ => None,
            });
            d.detect_zeroes = take_token(driver, "detect_zeroes", |t| match t {
                "off" => Some(DetectZeroes::Off),
                "on" => Some(DetectZeroes::On),
                "unmap" => Some(DetectZeroes::Unmap),
                _ => None,
            });
            d.queues = driver.take_attr_u32("queues");
            d.queue_size = driver.take_attr_u32("queue_size");
            if driver.attr("iothread").is_some() {
                warn!("disk driver iothread is not modeled; leaving in place");
            }
            if driver.has_child("metadata_cache") {
                warn!("disk driver metadata_cache is not modeled; leaving in place");
            }
            disk.driver = Some(d);
            node.prune_child("driver");
        }

        if let Some(address) = node.child_node_mut("address") {
            disk.address = Address::take_from(address);
            node.prune_child("address");
        }

        if node.take_child("readonly").is_some() {
            disk.readonly = true;
        }
        if node.take_child("shareable").is_some() {
            disk.shareable = true;
        }

        if let Some(target) = node.child_node_mut("target") {
            let mut t = DiskTarget::default();
            t.dev = target.take_attr("dev");
            t.bus = take_token(target, "bus", TargetBus::from_token);
            t.tray = target.take_attr_flag("tray", "open", "closed");
            t.removable = target.take_attr_flag("removable", "on", "off");
            t.rotation_rate = target.take_attr_u32("rotation_rate");
            disk.target = Some(t);
            node.prune_child("target");
        }

        if let Some(boot) = node.child_node_mut("boot") {
            disk.boot_order = boot.take_attr_u32("order");
            node.prune_child("boot");
        }

        if node.child("backingStore").is_some_and(XmlValue::is_empty) {
            node.take_child("backingStore");
            disk.backing_store = true;
        } else if node.has_child("backingStore") {
            warn!("backingStore sub-elements are not modeled; leaving in place");
        }

        disk.rest = node;
        disk
    }

    pub fn encode(&self) -> Result<XmlNode> {
        if let Some(driver) = self.rest.child_node("driver") {
            if driver.attr("iothread").is_some() {
                return Err(DomainError::NotImplemented("disk driver iothread"));
            }
            if driver.has_child("metadata_cache") {
                return Err(DomainError::NotImplemented("disk driver metadata_cache"));
            }
        }
        if self
            .rest
            .child("backingStore")
            .is_some_and(|v| !v.is_empty())
        {
            return Err(DomainError::NotImplemented("backingStore sub-elements"));
        }

        let mut node = self.rest.clone();
        if let Some(role) = self.role {
            node.set_attr("device", role.token());
        }
        if let Some(kind) = self.kind {
            node.set_attr("type", kind.token());
        }
        if let Some(source) = &self.source {
            let out = node.ensure_child("source");
            if let Some(index) = source.index {
                out.set_attr("index", index.to_string());
            }
            match &source.path {
                DiskSourcePath::File(path) => out.set_attr("file", path.clone()),
                DiskSourcePath::Block(path) => out.set_attr("block", path.clone()),
                DiskSourcePath::Dir(path) => out.set_attr("dir", path.clone()),
            }
        }
        if let Some(driver) = &self.driver {
            let out = node.ensure_child("driver");
            if driver.name.is_some() {
                out.set_attr("name", "qemu");
            }
            if let Some(format) = driver.format {
                let token = match format {
                    DriverFormat::Raw => "raw",
                    DriverFormat::Bochs => "bochs",
                    DriverFormat::Qcow2 => "qcow2",
                    DriverFormat::Qed => "qed",
                };
                out.set_attr("type", token);
            }
            if let Some(cache) = driver.cache {
                let token = match cache {
                    CacheMode::Default => "default",
                    CacheMode::None => "none",
                    CacheMode::Writethrough => "writethrough",
                    CacheMode::Writeback => "writeback",
                    CacheMode::Directsync => "directsync",
                    CacheMode::Unsafe => "unsafe",
                };
                out.set_attr("cache", token);
            }
            if let Some(policy) = driver.error_policy {
                let token = match policy {
                    ErrorPolicy::Stop => "stop",
                    ErrorPolicy::Report => "report",
                    ErrorPolicy::Ignore => "ignore",
                    ErrorPolicy::Enospace => "enospace",
                };
                out.set_attr("error_policy", token);
            }
            if let Some(io) = driver.io {
                out.set_attr("io", if io == IoMode::Threads { "threads" } else { "native" });
            }
            if let Some(v) = driver.ioeventfd {
                out.set_attr("ioeventfd", if v { "on" } else { "off" });
            }
            if let Some(v) = driver.event_idx {
                out.set_attr("event_idx", if v { "on" } else { "off" });
            }
            if let Some(v) = driver.copy_on_read {
                out.set_attr("copy_on_read", if v { "on" } else { "off" });
            }
            if let Some(discard) = driver.discard {
                out.set_attr(
                    "discard",
                    if discard == DiscardMode::Trim { "trim" } else { "unmap" },
                );
            }
            if let Some(dz) = driver.detect_zeroes {
                let token = match dz {
                    DetectZeroes::Off => "off",
                    DetectZeroes::On => "on",
                    DetectZeroes::Unmap => "unmap",
                };
                out.set_attr("detect_zeroes", token);
            }
            if let Some(queues) = driver.queues {
                out.set_attr("queues", queues.to_string());
            }
            if let Some(size) = driver.queue_size {
                out.set_attr("queue_size", size.to_string());
            }
        }
        if let Some(address) = &self.address {
            address.write_into(node.ensure_child("address"));
        }
        if self.readonly {
            node.put_child("readonly", XmlValue::Node(XmlNode::default()));
        }
        if self.shareable {
            node.put_child("shareable", XmlValue::Node(XmlNode::default()));
        }
        if let Some(target) = &self.target {
            let out = node.ensure_child("target");
            if let Some(dev) = &target.dev {
                out.set_attr("dev", dev.clone());
            }
            if let Some(bus) = target.bus {
                out.set_attr("bus", bus.token());
            }
            if let Some(tray) = target.tray {
                out.set_attr("tray", if tray { "open" } else { "closed" });
            }
            if let Some(removable) = target.removable {
                out.set_attr("removable", if removable { "on" } else { "off" });
            }
            if let Some(rate) = target.rotation_rate {
                out.set_attr("rotation_rate", rate.to_string());
            }
        }
        if let Some(order) = self.boot_order {
            node.ensure_child("boot").set_attr("order", order.to_string());
        }
        if self.backing_store {
            node.put_child("backingStore", XmlValue::Node(XmlNode::default()));
        }
        if let Some(alias) = &self.alias {
            node.ensure_child("alias").set_attr("name", alias.clone());
        }
        Ok(node)
    }
}
