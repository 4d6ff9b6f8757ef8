use serde::{Deserialize, Serialize};

use crate::tree::XmlNode;

/// Bus address of a device, discriminated by the `type` attribute.
///
/// Every numeric field is optional: libvirt fills addresses in lazily, so a
/// freshly defined device may carry only a subset. `None` means the attribute
/// was absent, which is distinct from an explicit zero: a present `bus="0"`
/// decodes to `Some(0)` and is re-emitted on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Address {
    Pci {
        domain: Option<u32>,
        bus: Option<u32>,
        slot: Option<u32>,
        function: Option<u32>,
        multifunction: Option<bool>,
    },
    Drive {
        controller: Option<u32>,
        bus: Option<u32>,
        target: Option<u32>,
        unit: Option<u32>,
    },
    Usb {
        bus: Option<u32>,
        port: Option<u32>,
    },
}

impl Address {
    /// Consumes a recognized address out of `node`. An absent or unrecognized
    /// `type` discriminator leaves the node untouched and yields `None`.
    pub fn take_from(node: &mut XmlNode) -> Option<Address> {
        let kind = node.attr("type")?.to_string();
        match kind.as_str() {
            "pci" => {
                node.take_attr("type");
                Some(Address::Pci {
                    bus: node.take_attr_u32("bus"),
                    slot: node.take_attr_u32("slot"),
                    function: node.take_attr_u32("function"),
                    domain: node.take_attr_u32("domain"),
                    multifunction: node.take_attr_flag("multifunction", "on", "off"),
                })
            }
            "drive" => {
                node.take_attr("type");
                Some(Address::Drive {
                    controller: node.take_attr_u32("controller"),
                    bus: node.take_attr_u32("bus"),
                    target: node.take_attr_u32("target"),
                    unit: node.take_attr_u32("unit"),
                })
            }
            "usb" => {
                node.take_attr("type");
                Some(Address::Usb {
                    bus: node.take_attr_u32("bus"),
                    port: node.take_attr_u32("port"),
                })
            }
            _ => None,
        }
    }

    /// Merges the address into `node`, keeping any attributes the address
    /// type does not own. Present zero values are written out.
    pub fn write_into(&self, node: &mut XmlNode) {
        match *self {
            Address::Pci {
                domain,
                bus,
                slot,
                function,
                multifunction,
            } => {
                node.set_attr("type", "pci");
                write_num(node, "domain", domain);
                write_num(node, "bus", bus);
                write_num(node, "slot", slot);
                write_num(node, "function", function);
                if let Some(multifunction) = multifunction {
                    node.set_attr("multifunction", if multifunction { "on" } else { "off" });
                }
            }
            Address::Drive {
                controller,
                bus,
                target,
                unit,
            } => {
                node.set_attr("type", "drive");
                write_num(node, "controller", controller);
                write_num(node, "bus", bus);
                write_num(node, "target", target);
                write_num(node, "unit", unit);
            }
            Address::Usb { bus, port } => {
                node.set_attr("type", "usb");
                write_num(node, "bus", bus);
                write_num(node, "port", port);
            }
        }
    }
}

fn write_num(node: &mut XmlNode, name: &str, value: Option<u32>) {
    if let Some(value) = value {
        node.set_attr(name, value.to_string());
    }
}
