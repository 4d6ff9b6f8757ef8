use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::tree::{take_token, XmlNode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Mouse,
    Keyboard,
    Tablet,
    Passthrough,
    Evdev,
    #[default]
    Unknown,
}

impl InputKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "mouse" => Some(InputKind::Mouse),
            "keyboard" => Some(InputKind::Keyboard),
            "tablet" => Some(InputKind::Tablet),
            "passthrough" => Some(InputKind::Passthrough),
            "evdev" => Some(InputKind::Evdev),
            _ => None,
        }
    }

    fn token(self) -> Option<&'static str> {
        match self {
            InputKind::Mouse => Some("mouse"),
            InputKind::Keyboard => Some("keyboard"),
            InputKind::Tablet => Some("tablet"),
            InputKind::Passthrough => Some("passthrough"),
            InputKind::Evdev => Some("evdev"),
            InputKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputBus {
    Usb,
    Ps2,
    Virtio,
}

impl InputBus {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "usb" => Some(InputBus::Usb),
            "ps2" => Some(InputBus::Ps2),
            "virtio" => Some(InputBus::Virtio),
            _ => None,
        }
    }

    fn token(self) -> &'static str {
        match self {
            InputBus::Usb => "usb",
            InputBus::Ps2 => "ps2",
            InputBus::Virtio => "virtio",
        }
    }
}

/// An `<input>` element. An unrecognized `type` or `bus` token stays in the
/// remainder, so the device still round-trips.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Input {
    pub kind: InputKind,
    pub bus: Option<InputBus>,
    pub address: Option<Address>,
    pub alias: Option<String>,
    pub rest: XmlNode,
}

impl Input {
    pub fn decode(mut node: XmlNode) -> Input {
        let mut input = Input::default();
        input.kind = take_token(&mut node, "type", InputKind::from_token).unwrap_or_default();
        input.bus = take_token(&mut node, "bus", InputBus::from_token);
        if let Some(address) = node.child_node_mut("address") {
            input.address = Address::take_from(address);
            node.prune_child("address");
        }
        if let Some(alias) = node.child_node_mut("alias") {
            input.alias = alias.take_attr("name");
            node.prune_child("alias");
        }
        input.rest = node;
        input
    }

    pub fn encode(&self) -> XmlNode {
        let mut node = self.rest.clone();
        if let Some(token) = self.kind.token() {
            node.set_attr("type", token);
        }
        if let Some(bus) = self.bus {
            node.set_attr("bus", bus.token());
        }
        if let Some(address) = &self.address {
            address.write_into(node.ensure_child("address"));
        }
        if let Some(alias) = &self.alias {
            node.ensure_child("alias").set_attr("name", alias.clone());
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_document;

    fn input_node(xml: &str) -> XmlNode {
        parse_document(xml)
            .unwrap()
            .take_child("input")
            .unwrap()
            .into_nodes()
            .remove(0)
    }

    #[test]
    fn decodes_usb_tablet() {
        let node = input_node(
            r#"<input type="tablet" bus="usb">
                 <alias name="input0"/>
                 <address type="usb" bus="0" port="1"/>
               </input>"#,
        );
        let input = Input::decode(node);
        assert_eq!(input.kind, InputKind::Tablet);
        assert_eq!(input.bus, Some(InputBus::Usb));
        assert_eq!(input.alias.as_deref(), Some("input0"));
        assert_eq!(
            input.address,
            Some(Address::Usb {
                bus: Some(0),
                port: Some(1),
            })
        );
        assert!(input.rest.is_empty());
    }

    #[test]
    fn unrecognized_tokens_stay_in_the_remainder() {
        let node = input_node(r#"<input type="wheel" bus="isa"/>"#);
        let input = Input::decode(node);
        assert_eq!(input.kind, InputKind::Unknown);
        assert_eq!(input.bus, None);
        let out = input.encode();
        assert_eq!(out.attr("type"), Some("wheel"));
        assert_eq!(out.attr("bus"), Some("isa"));
    }

    #[test]
    fn ps2_keyboard_round_trips() {
        let node = input_node(r#"<input type="keyboard" bus="ps2"/>"#);
        let input = Input::decode(node);
        let out = input.encode();
        assert_eq!(out.attr("type"), Some("keyboard"));
        assert_eq!(out.attr("bus"), Some("ps2"));
    }
}
