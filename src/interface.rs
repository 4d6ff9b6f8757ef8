use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::Address;
use crate::tree::{take_token, XmlNode};

/// A `<interface>` element. Only virtual-network interfaces are modeled;
/// other attachment types (bridge, direct, hostdev, ...) are kept whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    Network(NetworkInterface),
    Unknown(XmlNode),
}

/// Guest NIC models libvirt accepts for emulated and paravirtual hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicModel {
    Virtio,
    E1000,
    I82551,
    I82557b,
    I82559er,
    Rtl8139,
    Pcnet,
    Ne2kIsa,
    Ne2kPci,
}

impl NicModel {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "virtio" => Some(NicModel::Virtio),
            "e1000" => Some(NicModel::E1000),
            "i82551" => Some(NicModel::I82551),
            "i82557b" => Some(NicModel::I82557b),
            "i82559er" => Some(NicModel::I82559er),
            "rtl8139" => Some(NicModel::Rtl8139),
            "pcnet" => Some(NicModel::Pcnet),
            "ne2k_isa" => Some(NicModel::Ne2kIsa),
            "ne2k_pci" => Some(NicModel::Ne2kPci),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::I82551 => "i82551",
            NicModel::I82557b => "i82557b",
            NicModel::I82559er => "i82559er",
            NicModel::Rtl8139 => "rtl8139",
            NicModel::Pcnet => "pcnet",
            NicModel::Ne2kIsa => "ne2k_isa",
            NicModel::Ne2kPci => "ne2k_pci",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterface {
    pub mac_address: Option<String>,
    pub source_network: Option<String>,
    pub source_bridge: Option<String>,
    pub source_portid: Option<String>,
    pub model: Option<NicModel>,
    pub target_dev: Option<String>,
    pub target_managed: Option<bool>,
    pub alias: Option<String>,
    pub address: Option<Address>,
    pub rest: XmlNode,
}

impl Interface {
    pub fn decode(mut node: XmlNode) -> Interface {
        if node.attr("type") != Some("network") {
            warn!(
                "Unknown interface kind '{}', preserving element as-is",
                node.attr("type").unwrap_or("<absent>")
            );
            return Interface::Unknown(node);
        }
        node.take_attr("type");
        let mut nic = NetworkInterface::default();
        if let Some(mac) = node.child_node_mut("mac") {
            nic.mac_address = mac.take_attr("address");
            node.prune_child("mac");
        }
        if let Some(source) = node.child_node_mut("source") {
            nic.source_network = source.take_attr("network");
            nic.source_bridge = source.take_attr("bridge");
            nic.source_portid = source.take_attr("portid");
            node.prune_child("source");
        }
        if let Some(target) = node.child_node_mut("target") {
            nic.target_dev = target.take_attr("dev");
            nic.target_managed = target.take_attr_flag("managed", "yes", "no");
            node.prune_child("target");
        }
        if let Some(model) = node.child_node_mut("model") {
            nic.model = take_token(model, "type", NicModel::from_token);
            node.prune_child("model");
        }
        if let Some(alias) = node.child_node_mut("alias") {
            nic.alias = alias.take_attr("name");
            node.prune_child("alias");
        }
        if let Some(address) = node.child_node_mut("address") {
            nic.address = Address::take_from(address);
            node.prune_child("address");
        }
        nic.rest = node;
        Interface::Network(nic)
    }

    pub fn encode(&self) -> XmlNode {
        match self {
            Interface::Unknown(node) => node.clone(),
            Interface::Network(nic) => {
                let mut node = nic.rest.clone();
                node.set_attr("type", "network");
                if let Some(mac) = &nic.mac_address {
                    node.ensure_child("mac").set_attr("address", mac.clone());
                }
                if nic.target_dev.is_some() || nic.target_managed.is_some() {
                    let out = node.ensure_child("target");
                    if let Some(dev) = &nic.target_dev {
                        out.set_attr("dev", dev.clone());
                    }
                    if let Some(managed) = nic.target_managed {
                        out.set_attr("managed", if managed { "yes" } else { "no" });
                    }
                }
                if let Some(model) = nic.model {
                    node.ensure_child("model").set_attr("type", model.token());
                }
                if let Some(alias) = &nic.alias {
                    node.ensure_child("alias").set_attr("name", alias.clone());
                }
                if nic.source_network.is_some()
                    || nic.source_bridge.is_some()
                    || nic.source_portid.is_some()
                {
                    let out = node.ensure_child("source");
                    if let Some(bridge) = &nic.source_bridge {
                        out.set_attr("bridge", bridge.clone());
                    }
                    if let Some(network) = &nic.source_network {
                        out.set_attr("network", network.clone());
                    }
                    if let Some(portid) = &nic.source_portid {
                        out.set_attr("portid", portid.clone());
                    }
                }
                if let Some(address) = &nic.address {
                    address.write_into(node.ensure_child("address"));
                }
                node
            }
        }
    }
}
