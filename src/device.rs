use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::disk::Disk;
use crate::errors::Result;
use crate::graphics::Graphics;
use crate::input::Input;
use crate::interface::Interface;
use crate::tree::{XmlNode, XmlValue};

/// A device the hypervisor attaches to a VM. `Unknown` exists for callers
/// building definitions out of band; decoding never produces it, because
/// unrecognized device *tags* simply stay in the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Disk(Disk),
    Graphics(Graphics),
    Interface(Interface),
    Input(Input),
    Unknown(UnknownDevice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownDevice {
    pub tag: String,
    pub node: XmlNode,
}

/// Decodes every occurrence of `tag` in the devices container into `out`.
/// The tag's value may be a single node or a list; both shapes run through
/// the same per-entry decoder. The key is always consumed; whatever an
/// entry's decoder did not understand lives on as that device's remainder.
pub fn decode_device_list(
    out: &mut Vec<Device>,
    container: &mut XmlNode,
    tag: &str,
    decode: impl Fn(XmlNode) -> Device,
) {
    let Some(value) = container.take_child(tag) else {
        return;
    };
    let nodes = value.into_nodes();
    debug!("Decoding {} <{}> entries", nodes.len(), tag);
    for node in nodes {
        out.push(decode(node));
    }
}

/// Encodes the device list into the `devices` container of `result`,
/// grouping by output tag and appending in original relative order within
/// each tag group. Pre-existing entries for tags the codec never touched are
/// left where they are. A tag with exactly one entry is written as a single
/// node so a decoded tree re-encodes in its original shape.
pub fn encode_devices(devices: &[Device], result: &mut XmlNode) -> Result<()> {
    let container = result.ensure_child("devices");
    let mut encoded: Vec<(&str, XmlNode)> = Vec::with_capacity(devices.len());
    for device in devices {
        let entry = match device {
            Device::Disk(disk) => ("disk", disk.encode()?),
            Device::Graphics(graphics) => ("graphics", graphics.encode()),
            Device::Interface(interface) => ("interface", interface.encode()),
            Device::Input(input) => ("input", input.encode()),
            Device::Unknown(unknown) => (unknown.tag.as_str(), unknown.node.clone()),
        };
        encoded.push(entry);
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (tag, _) in &encoded {
        *counts.entry(tag).or_insert(0) += 1;
    }
    for (tag, node) in encoded {
        if counts[tag] == 1 && !container.has_child(tag) {
            container.put_child(tag, XmlValue::Node(node));
        } else {
            container.push_child(tag, XmlValue::Node(node));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskSource, DiskSourcePath};
    use crate::tree::parse_document;

    fn devices_container(xml: &str) -> XmlNode {
        parse_document(xml)
            .unwrap()
            .take_child("devices")
            .unwrap()
            .into_nodes()
            .remove(0)
    }

    fn decode_disks(container: &mut XmlNode) -> Vec<Device> {
        let mut out = Vec::new();
        decode_device_list(&mut out, container, "disk", |n| Device::Disk(Disk::decode(n)));
        out
    }

    #[test]
    fn single_element_and_list_use_the_same_path() {
        let mut single = devices_container(
            r#"<devices><disk type="file"><source file="/a.img"/></disk></devices>"#,
        );
        let mut list = devices_container(
            r#"<devices>
                 <disk type="file"><source file="/a.img"/></disk>
                 <disk type="file"><source file="/b.img"/></disk>
               </devices>"#,
        );
        let singles = decode_disks(&mut single);
        let doubles = decode_disks(&mut list);
        assert_eq!(singles.len(), 1);
        assert_eq!(doubles.len(), 2);
        let Device::Disk(first) = &singles[0] else {
            panic!("expected disk");
        };
        let Device::Disk(other) = &doubles[0] else {
            panic!("expected disk");
        };
        assert_eq!(first.source, other.source);
        assert_eq!(
            first.source,
            Some(DiskSource {
                path: DiskSourcePath::File("/a.img".to_string()),
                index: None,
            })
        );
        // the tag key is consumed in both shapes
        assert!(!single.has_child("disk"));
        assert!(!list.has_child("disk"));
    }

    #[test]
    fn foreign_tags_stay_in_the_container() {
        let mut container = devices_container(
            r#"<devices>
                 <emulator>/usr/bin/qemu-system-x86_64</emulator>
                 <disk type="file"/>
                 <controller type="usb" index="0"/>
               </devices>"#,
        );
        let devices = decode_disks(&mut container);
        assert_eq!(devices.len(), 1);
        assert!(container.has_child("emulator"));
        assert!(container.has_child("controller"));
    }

    #[test]
    fn encode_groups_devices_by_tag_in_order() {
        let mut container = devices_container(
            r#"<devices>
                 <disk type="file"><source file="/a.img"/></disk>
                 <input type="mouse" bus="ps2"/>
                 <disk type="file"><source file="/b.img"/></disk>
               </devices>"#,
        );
        let mut devices = decode_disks(&mut container);
        decode_device_list(&mut devices, &mut container, "input", |n| {
            Device::Input(Input::decode(n))
        });

        let mut result = XmlNode::default();
        encode_devices(&devices, &mut result).unwrap();
        let out = result.child_node("devices").unwrap();
        let Some(XmlValue::List(disks)) = out.child("disk") else {
            panic!("expected disk list");
        };
        assert_eq!(disks.len(), 2);
        let first = match &disks[0] {
            XmlValue::Node(n) => n,
            other => panic!("expected node, got {other:?}"),
        };
        assert_eq!(first.child_node("source").unwrap().attr("file"), Some("/a.img"));
        assert!(out.child("input").is_some());
    }

    #[test]
    fn unknown_device_reemits_its_node() {
        let mut node = XmlNode::default();
        node.set_attr("model", "virtio");
        let devices = vec![Device::Unknown(UnknownDevice {
            tag: "rng".to_string(),
            node,
        })];
        let mut result = XmlNode::default();
        encode_devices(&devices, &mut result).unwrap();
        let container = result.child_node("devices").unwrap();
        let rng = container.child_node("rng").expect("single rng node");
        assert_eq!(rng.attr("model"), Some("virtio"));
    }

    #[test]
    fn single_entry_reencodes_in_single_shape() {
        let mut container = devices_container(
            r#"<devices><disk type="file"><source file="/a.img"/></disk></devices>"#,
        );
        let devices = decode_disks(&mut container);
        let mut result = XmlNode::default();
        encode_devices(&devices, &mut result).unwrap();
        let out = result.child_node("devices").unwrap();
        assert!(matches!(out.child("disk"), Some(XmlValue::Node(_))));
    }
}
