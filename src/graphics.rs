use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tree::XmlNode;

/// A `<graphics>` element. Only VNC is modeled; any other display type is
/// kept whole as an unknown variant so nothing of it is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Graphics {
    Vnc(VncGraphics),
    Unknown(XmlNode),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VncGraphics {
    /// `-1` together with autoport means libvirt picks the port.
    pub port: Option<i32>,
    pub autoport: Option<bool>,
    pub passwd: Option<String>,
    pub websocket: Option<i32>,
    pub listen: Option<String>,
    pub keymap: Option<String>,
    pub listen_type: Option<String>,
    pub listen_address: Option<String>,
    pub rest: XmlNode,
}

impl Graphics {
    pub fn decode(mut node: XmlNode) -> Graphics {
        if node.attr("type") != Some("vnc") {
            warn!(
                "Unknown graphics kind '{}', preserving element as-is",
                node.attr("type").unwrap_or("<absent>")
            );
            return Graphics::Unknown(node);
        }
        node.take_attr("type");
        let mut vnc = VncGraphics::default();
        vnc.port = node.take_attr_i32("port");
        vnc.autoport = node.take_attr_flag("autoport", "yes", "no");
        vnc.passwd = node.take_attr("passwd");
        vnc.websocket = node.take_attr_i32("websocket");
        vnc.listen = node.take_attr("listen");
        vnc.keymap = node.take_attr("keymap");
        if let Some(listen) = node.child_node_mut("listen") {
            vnc.listen_type = listen.take_attr("type");
            vnc.listen_address = listen.take_attr("address");
            node.prune_child("listen");
        }
        vnc.rest = node;
        Graphics::Vnc(vnc)
    }

    pub fn encode(&self) -> XmlNode {
        match self {
            Graphics::Unknown(node) => node.clone(),
            Graphics::Vnc(vnc) => {
                let mut node = vnc.rest.clone();
                node.set_attr("type", "vnc");
                if let Some(port) = vnc.port {
                    node.set_attr("port", port.to_string());
                }
                if let Some(autoport) = vnc.autoport {
                    node.set_attr("autoport", if autoport { "yes" } else { "no" });
                }
                if let Some(passwd) = &vnc.passwd {
                    node.set_attr("passwd", passwd.clone());
                }
                if let Some(websocket) = vnc.websocket {
                    node.set_attr("websocket", websocket.to_string());
                }
                if let Some(listen) = &vnc.listen {
                    node.set_attr("listen", listen.clone());
                }
                if let Some(keymap) = &vnc.keymap {
                    node.set_attr("keymap", keymap.clone());
                }
                if vnc.listen_type.is_some() || vnc.listen_address.is_some() {
                    let out = node.ensure_child("listen");
                    if let Some(kind) = &vnc.listen_type {
                        out.set_attr("type", kind.clone());
                    }
                    if let Some(address) = &vnc.listen_address {
                        out.set_attr("address", address.clone());
                    }
                }
                node
            }
        }
    }
}
