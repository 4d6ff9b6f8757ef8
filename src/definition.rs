use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::device::{decode_device_list, encode_devices, Device};
use crate::disk::Disk;
use crate::errors::{DomainError, Result};
use crate::graphics::Graphics;
use crate::input::Input;
use crate::interface::Interface;
use crate::tree::{XmlNode, XmlValue};

const LIBOSINFO_XMLNS: &str = "http://libosinfo.org/xmlns/libvirt/domain/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Hvm,
    Linux,
    Exe,
}

impl OsType {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "hvm" => Some(OsType::Hvm),
            "linux" => Some(OsType::Linux),
            "exe" => Some(OsType::Exe),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            OsType::Hvm => "hvm",
            OsType::Linux => "linux",
            OsType::Exe => "exe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsArch {
    X86_64,
    I686,
    Aarch64,
    Armv6l,
    Armv7l,
    Ppc,
    Ppc64,
    Ppc64le,
    S390,
    S390x,
    Riscv32,
    Riscv64,
    Mips,
    Mipsel,
    Mips64,
    Mips64el,
    Loongarch64,
}

impl OsArch {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "x86_64" => Some(OsArch::X86_64),
            "i686" => Some(OsArch::I686),
            "aarch64" => Some(OsArch::Aarch64),
            "armv6l" => Some(OsArch::Armv6l),
            "armv7l" => Some(OsArch::Armv7l),
            "ppc" => Some(OsArch::Ppc),
            "ppc64" => Some(OsArch::Ppc64),
            "ppc64le" => Some(OsArch::Ppc64le),
            "s390" => Some(OsArch::S390),
            "s390x" => Some(OsArch::S390x),
            "riscv32" => Some(OsArch::Riscv32),
            "riscv64" => Some(OsArch::Riscv64),
            "mips" => Some(OsArch::Mips),
            "mipsel" => Some(OsArch::Mipsel),
            "mips64" => Some(OsArch::Mips64),
            "mips64el" => Some(OsArch::Mips64el),
            "loongarch64" => Some(OsArch::Loongarch64),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            OsArch::X86_64 => "x86_64",
            OsArch::I686 => "i686",
            OsArch::Aarch64 => "aarch64",
            OsArch::Armv6l => "armv6l",
            OsArch::Armv7l => "armv7l",
            OsArch::Ppc => "ppc",
            OsArch::Ppc64 => "ppc64",
            OsArch::Ppc64le => "ppc64le",
            OsArch::S390 => "s390",
            OsArch::S390x => "s390x",
            OsArch::Riscv32 => "riscv32",
            OsArch::Riscv64 => "riscv64",
            OsArch::Mips => "mips",
            OsArch::Mipsel => "mipsel",
            OsArch::Mips64 => "mips64",
            OsArch::Mips64el => "mips64el",
            OsArch::Loongarch64 => "loongarch64",
        }
    }
}

/// The typed view of one domain definition. Every scalar field is optional:
/// `None` means the field was absent in the source (or the caller has no
/// opinion), and encoding leaves the raw payload untouched for it. Encode is
/// a partial-update merge, never a full replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefinition {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Hypervisor driver, from the root `type` attribute (`kvm`, `qemu`, ...).
    pub hypervisor: Option<String>,
    /// Canonical byte count, converted from the `(magnitude, unit)` pair.
    pub memory: Option<u64>,
    pub vcpu_count: Option<u32>,
    /// Libosinfo operating-system id URL from the metadata namespace.
    pub os_id: Option<String>,
    pub os_type: Option<OsType>,
    pub os_arch: Option<OsArch>,
    pub devices: Vec<Device>,
    /// Everything the codec did not understand, replayed verbatim on encode.
    raw: XmlNode,
    /// Content hash of the tree this definition was decoded from.
    revision: Option<String>,
}

impl VmDefinition {
    /// A fresh definition for a brand-new VM: empty payload, generated UUID.
    pub fn new(name: impl Into<String>) -> VmDefinition {
        VmDefinition {
            name: Some(name.into()),
            uuid: Some(Uuid::new_v4().to_string()),
            ..VmDefinition::default()
        }
    }

    pub fn raw(&self) -> &XmlNode {
        &self.raw
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Decodes the root `<domain>` element. Fails only when the root is not
    /// an element at all; everything else degrades field by field.
    pub fn decode(root: XmlValue) -> Result<VmDefinition> {
        let XmlValue::Node(mut node) = root else {
            return Err(DomainError::MalformedDocument(
                "domain root is not an element".to_string(),
            ));
        };
        let revision = node.content_hash();
        debug!("Decoding domain definition at revision {}", revision);

        let mut def = VmDefinition::default();
        def.revision = Some(revision);
        def.name = node.take_text_child("name");
        def.id = node.take_attr_u32("id");

        def.memory = take_memory(&mut node);

        def.uuid = node.take_text_child("uuid");

        let vcpu_text = match node.child("vcpu") {
            Some(XmlValue::Text(t)) => Some(t.clone()),
            Some(XmlValue::Node(n)) => n.text.clone(),
            _ => None,
        };
        def.vcpu_count = vcpu_text.as_deref().and_then(|t| t.trim().parse().ok());
        if def.vcpu_count.is_some() {
            node.take_text_child("vcpu");
        }

        def.title = node.take_text_child("title");
        def.description = node.take_text_child("description");
        def.hypervisor = node.take_attr("type");

        def.os_id = take_os_id(&mut node);
        let (os_type, os_arch) = take_os_type(&mut node);
        def.os_type = os_type;
        def.os_arch = os_arch;

        if let Some(container) = node.child_node_mut("devices") {
            decode_device_list(&mut def.devices, container, "disk", |n| {
                Device::Disk(Disk::decode(n))
            });
            decode_device_list(&mut def.devices, container, "graphics", |n| {
                Device::Graphics(Graphics::decode(n))
            });
            decode_device_list(&mut def.devices, container, "interface", |n| {
                Device::Interface(Interface::decode(n))
            });
            decode_device_list(&mut def.devices, container, "input", |n| {
                Device::Input(Input::decode(n))
            });
        }
        node.prune_child("devices");

        debug!(
            "Decoded domain definition: name={}, devices={}",
            def.name.as_deref().unwrap_or("<unnamed>"),
            def.devices.len()
        );
        def.raw = node;
        Ok(def)
    }

    /// Encodes the definition onto its raw payload. Fields that are `None`
    /// never clear what the payload already carries.
    pub fn encode(mut self) -> Result<XmlNode> {
        let mut result = std::mem::take(&mut self.raw);
        if let Some(id) = self.id {
            result.set_attr("id", id.to_string());
        }
        if let Some(name) = self.name.take() {
            result.set_text_child("name", name);
        }
        if let Some(memory) = self.memory {
            let (magnitude, unit) = format_memory(memory);
            let out = result.ensure_child("memory");
            out.text = Some(magnitude);
            out.set_attr("unit", unit);
        }
        if let Some(uuid) = self.uuid.take() {
            result.set_text_child("uuid", uuid);
        }
        if let Some(vcpu_count) = self.vcpu_count {
            result.ensure_child("vcpu").text = Some(vcpu_count.to_string());
        }
        if let Some(title) = self.title.take() {
            result.set_text_child("title", title);
        }
        if let Some(description) = self.description.take() {
            result.set_text_child("description", description);
        }
        if let Some(hypervisor) = self.hypervisor.take() {
            result.set_attr("type", hypervisor);
        }
        if let Some(os_id) = self.os_id.take() {
            let libosinfo = result
                .ensure_child("metadata")
                .ensure_child("libosinfo:libosinfo");
            libosinfo.set_attr("xmlns:libosinfo", LIBOSINFO_XMLNS);
            libosinfo.ensure_child("libosinfo:os").set_attr("id", os_id);
        }
        if self.os_type.is_some() || self.os_arch.is_some() {
            let out = result.ensure_child("os").ensure_child("type");
            if let Some(os_type) = self.os_type {
                out.text = Some(os_type.token().to_string());
            }
            if let Some(os_arch) = self.os_arch {
                out.set_attr("arch", os_arch.token());
            }
        }
        encode_devices(&self.devices, &mut result)?;
        Ok(result)
    }

    /// Encode with a lost-update guard: fails when the hypervisor's current
    /// tree no longer matches the revision this definition was decoded from.
    pub fn encode_checked(self, current: &XmlNode) -> Result<XmlNode> {
        match &self.revision {
            Some(expected) => {
                let actual = current.content_hash();
                if *expected != actual {
                    return Err(DomainError::StaleDefinition {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            None => debug!("definition carries no revision token, skipping staleness check"),
        }
        self.encode()
    }
}

fn take_memory(node: &mut XmlNode) -> Option<u64> {
    let parsed = match node.child("memory") {
        Some(XmlValue::Text(t)) => parse_memory(t, "b"),
        Some(XmlValue::Node(m)) => {
            parse_memory(m.text.as_deref().unwrap_or("0"), m.attr("unit").unwrap_or("b"))
        }
        _ => None,
    };
    if parsed.is_none() {
        if node.has_child("memory") {
            warn!("unparsable memory element, leaving in place");
        }
        return None;
    }
    if matches!(node.child("memory"), Some(XmlValue::Text(_))) {
        node.take_child("memory");
    } else if let Some(m) = node.child_node_mut("memory") {
        m.text = None;
        m.attributes.shift_remove("unit");
    }
    node.prune_child("memory");
    parsed
}

fn take_os_id(node: &mut XmlNode) -> Option<String> {
    let mut os_id = None;
    if let Some(metadata) = node.child_node_mut("metadata") {
        if let Some(libosinfo) = metadata.child_node_mut("libosinfo:libosinfo") {
            if let Some(os) = libosinfo.child_node_mut("libosinfo:os") {
                os_id = os.take_attr("id");
            }
            if os_id.is_some() {
                if libosinfo
                    .child("libosinfo:os")
                    .is_some_and(XmlValue::is_empty)
                {
                    libosinfo.take_child("libosinfo:os");
                    libosinfo.take_attr("xmlns:libosinfo");
                }
            }
        }
        if os_id.is_some() {
            metadata.prune_child("libosinfo:libosinfo");
        }
    }
    if os_id.is_some() {
        node.prune_child("metadata");
    }
    os_id
}

fn take_os_type(node: &mut XmlNode) -> (Option<OsType>, Option<OsArch>) {
    let mut os_type = None;
    let mut os_arch = None;
    if let Some(os) = node.child_node_mut("os") {
        let scalar = match os.child("type") {
            Some(XmlValue::Text(t)) => Some(t.clone()),
            _ => None,
        };
        if let Some(token) = scalar {
            match OsType::from_token(token.trim()) {
                Some(parsed) => {
                    os_type = Some(parsed);
                    os.take_child("type");
                }
                None => warn!("Unrecognized OS type '{}', skipping", token),
            }
        } else if let Some(element) = os.child_node_mut("type") {
            if let Some(text) = element.text.clone() {
                match OsType::from_token(text.trim()) {
                    Some(parsed) => {
                        os_type = Some(parsed);
                        element.text = None;
                    }
                    None => warn!("Unrecognized OS type '{}', skipping", text),
                }
            }
            if let Some(token) = element.attr("arch").map(str::to_string) {
                match OsArch::from_token(&token) {
                    Some(parsed) => {
                        os_arch = Some(parsed);
                        element.take_attr("arch");
                    }
                    None => warn!("Unrecognized OS architecture '{}', skipping", token),
                }
            }
        }
        os.prune_child("type");
    }
    node.prune_child("os");
    (os_type, os_arch)
}

/// Converts a `(magnitude, unit)` pair to bytes using libvirt's unit
/// spellings: bare `K`/`M`/`G`/`T` and the `iB` forms are binary, the `B`
/// forms are decimal, and a missing unit means bytes.
pub fn parse_memory(magnitude: &str, unit: &str) -> Option<u64> {
    let value: u64 = magnitude.trim().parse().ok()?;
    value.checked_mul(unit_factor(unit)?)
}

fn unit_factor(unit: &str) -> Option<u64> {
    match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => Some(1),
        "k" | "kib" => Some(1 << 10),
        "kb" => Some(1_000),
        "m" | "mib" => Some(1 << 20),
        "mb" => Some(1_000_000),
        "g" | "gib" => Some(1 << 30),
        "gb" => Some(1_000_000_000),
        "t" | "tib" => Some(1 << 40),
        "tb" => Some(1_000_000_000_000),
        _ => None,
    }
}

/// Formats a byte count as the largest IEC unit that divides it exactly, so
/// `536870912` renders as `512 MiB` and odd sizes fall back to bytes.
pub fn format_memory(bytes: u64) -> (String, &'static str) {
    const UNITS: [(&str, u64); 4] = [
        ("TiB", 1 << 40),
        ("GiB", 1 << 30),
        ("MiB", 1 << 20),
        ("KiB", 1 << 10),
    ];
    if bytes == 0 {
        return ("0".to_string(), "B");
    }
    for (unit, factor) in UNITS {
        if bytes % factor == 0 {
            return ((bytes / factor).to_string(), unit);
        }
    }
    (bytes.to_string(), "B")
}

/// Parses a human-entered size like `512MiB` or `4 GiB` into bytes.
pub fn parse_size(input: &str) -> Option<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (magnitude, unit) = input.split_at(split);
    if magnitude.is_empty() {
        return None;
    }
    let unit = unit.trim();
    parse_memory(magnitude, if unit.is_empty() { "b" } else { unit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_document;

    const DOMAIN: &str = r#"
<domain type="kvm" id="3">
  <name>web01</name>
  <uuid>7b8f1c6e-4f4b-4e72-9d2c-1f1b30a2a7e5</uuid>
  <title>Web frontend</title>
  <description>Primary web server</description>
  <metadata>
    <libosinfo:libosinfo xmlns:libosinfo="http://libosinfo.org/xmlns/libvirt/domain/1.0">
      <libosinfo:os id="http://debian.org/debian/12"/>
    </libosinfo:libosinfo>
  </metadata>
  <memory unit="MiB">512</memory>
  <vcpu placement="static">2</vcpu>
  <os>
    <type arch="x86_64" machine="q35">hvm</type>
    <boot dev="hd"/>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/libvirt/images/web01.qcow2"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <interface type="network">
      <mac address="52:54:00:11:22:33"/>
      <source network="default"/>
      <model type="virtio"/>
    </interface>
    <graphics type="vnc" port="-1" autoport="yes"/>
    <input type="tablet" bus="usb"/>
  </devices>
</domain>"#;

    fn decode_fixture() -> VmDefinition {
        let root = parse_document(DOMAIN).unwrap().take_child("domain").unwrap();
        VmDefinition::decode(root).unwrap()
    }

    #[test]
    fn decodes_scalar_fields() {
        let def = decode_fixture();
        assert_eq!(def.id, Some(3));
        assert_eq!(def.name.as_deref(), Some("web01"));
        assert_eq!(def.uuid.as_deref(), Some("7b8f1c6e-4f4b-4e72-9d2c-1f1b30a2a7e5"));
        assert_eq!(def.title.as_deref(), Some("Web frontend"));
        assert_eq!(def.description.as_deref(), Some("Primary web server"));
        assert_eq!(def.hypervisor.as_deref(), Some("kvm"));
        assert_eq!(def.memory, Some(512 * 1024 * 1024));
        assert_eq!(def.vcpu_count, Some(2));
        assert_eq!(def.os_id.as_deref(), Some("http://debian.org/debian/12"));
        assert_eq!(def.os_type, Some(OsType::Hvm));
        assert_eq!(def.os_arch, Some(OsArch::X86_64));
        assert_eq!(def.devices.len(), 4);
    }

    #[test]
    fn metadata_leaves_no_empty_husks() {
        let def = decode_fixture();
        assert!(!def.raw().has_child("metadata"));
    }

    #[test]
    fn consumed_scalars_leave_the_payload() {
        let def = decode_fixture();
        let raw = def.raw();
        assert!(!raw.has_child("name"));
        assert!(!raw.has_child("memory"));
        assert!(!raw.has_child("uuid"));
        assert!(raw.attr("id").is_none());
        // placement survives on the vcpu element
        assert_eq!(
            raw.child_node("vcpu").unwrap().attr("placement"),
            Some("static")
        );
        // machine attribute and boot order are not modeled and stay behind
        let os = raw.child_node("os").unwrap();
        assert_eq!(os.child_node("type").unwrap().attr("machine"), Some("q35"));
        assert!(os.has_child("boot"));
    }

    #[test]
    fn missing_id_stays_absent() {
        let root = parse_document("<domain type=\"kvm\"><name>a</name></domain>")
            .unwrap()
            .take_child("domain")
            .unwrap();
        let def = VmDefinition::decode(root).unwrap();
        assert_eq!(def.id, None);
        let out = def.encode().unwrap();
        assert_eq!(out.attr("id"), None);
    }

    #[test]
    fn unrecognized_os_tokens_are_skipped_but_kept() {
        let root = parse_document(
            "<domain><os><type arch=\"sparc64\">uefi-app</type></os></domain>",
        )
        .unwrap()
        .take_child("domain")
        .unwrap();
        let def = VmDefinition::decode(root).unwrap();
        assert_eq!(def.os_type, None);
        assert_eq!(def.os_arch, None);
        let os = def.raw().child_node("os").unwrap();
        let kept = os.child_node("type").unwrap();
        assert_eq!(kept.attr("arch"), Some("sparc64"));
        assert_eq!(kept.text.as_deref(), Some("uefi-app"));
    }

    #[test]
    fn root_must_be_an_element() {
        assert!(matches!(
            VmDefinition::decode(XmlValue::Text("garbage".to_string())),
            Err(DomainError::MalformedDocument(_))
        ));
    }

    #[test]
    fn memory_unit_law() {
        assert_eq!(parse_memory("512", "MiB"), Some(512 * 1024 * 1024));
        assert_eq!(format_memory(536870912), ("512".to_string(), "MiB"));
        assert_eq!(parse_memory("2", "KB"), Some(2000));
        assert_eq!(parse_memory("1", "T"), Some(1 << 40));
        assert_eq!(parse_memory("abc", "MiB"), None);
        assert_eq!(format_memory(0), ("0".to_string(), "B"));
        assert_eq!(format_memory(1500), ("1500".to_string(), "B"));
    }

    #[test]
    fn parse_size_accepts_human_input() {
        assert_eq!(parse_size("512MiB"), Some(512 << 20));
        assert_eq!(parse_size("4 GiB"), Some(4u64 << 30));
        assert_eq!(parse_size("1048576"), Some(1048576));
        assert_eq!(parse_size("GiB"), None);
    }

    #[test]
    fn reencoding_against_the_same_tree_passes_the_staleness_check() {
        let doc = parse_document(DOMAIN).unwrap();
        let pristine = match doc.child("domain") {
            Some(XmlValue::Node(n)) => n.clone(),
            other => panic!("expected node, got {other:?}"),
        };
        let def = VmDefinition::decode(XmlValue::Node(pristine.clone())).unwrap();
        assert!(def.encode_checked(&pristine).is_ok());
    }

    #[test]
    fn reencoding_against_a_changed_tree_is_rejected() {
        let doc = parse_document(DOMAIN).unwrap();
        let pristine = match doc.child("domain") {
            Some(XmlValue::Node(n)) => n.clone(),
            other => panic!("expected node, got {other:?}"),
        };
        let def = VmDefinition::decode(XmlValue::Node(pristine.clone())).unwrap();
        let mut moved_on = pristine;
        moved_on.set_text_child("title", "renamed elsewhere");
        match def.encode_checked(&moved_on) {
            Err(DomainError::StaleDefinition { expected, actual }) => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected StaleDefinition, got {other:?}"),
        }
    }

    #[test]
    fn fresh_definition_has_a_uuid_and_empty_payload() {
        let def = VmDefinition::new("scratch");
        assert_eq!(def.name.as_deref(), Some("scratch"));
        assert!(def.uuid.is_some());
        assert!(def.raw().is_empty());
        assert_eq!(def.revision(), None);
    }
}
