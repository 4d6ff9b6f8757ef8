use indexmap::IndexMap;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{DomainError, Result};

/// One value slot in the generic tree. XML permits zero, one or many
/// occurrences of the same tag, and an element carrying nothing but text
/// collapses to a plain string, so a child is either a text scalar, a single
/// node, or an ordered list of further values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum XmlValue {
    Text(String),
    Node(XmlNode),
    List(Vec<XmlValue>),
}

/// Generic element node: string-valued attributes, optional text content and
/// named children, all in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlNode {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<String, XmlValue>,
}

impl XmlValue {
    pub fn is_empty(&self) -> bool {
        match self {
            XmlValue::Text(t) => t.trim().is_empty(),
            XmlValue::Node(n) => n.is_empty(),
            XmlValue::List(items) => items.iter().all(XmlValue::is_empty),
        }
    }

    /// Normalizes the single-node-or-list cardinality to a flat list of
    /// nodes. A text scalar becomes a node carrying only that text.
    pub fn into_nodes(self) -> Vec<XmlNode> {
        match self {
            XmlValue::Text(t) => vec![XmlNode::from_text(t)],
            XmlValue::Node(n) => vec![n],
            XmlValue::List(items) => items.into_iter().flat_map(XmlValue::into_nodes).collect(),
        }
    }
}

impl XmlNode {
    pub fn from_text(text: String) -> Self {
        XmlNode {
            text: Some(text),
            ..XmlNode::default()
        }
    }

    /// True iff the node has no attributes, no children and no non-blank
    /// text. Empty nodes are pruned from their parents after extraction.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.children.is_empty()
            && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn take_attr(&mut self, name: &str) -> Option<String> {
        self.attributes.shift_remove(name)
    }

    /// Consumes a numeric attribute. Libvirt writes PCI addresses in hex
    /// (`0x0000`), other counters in decimal; both forms are accepted. An
    /// unparsable value is left in place so it survives as unknown content.
    pub fn take_attr_u32(&mut self, name: &str) -> Option<u32> {
        let parsed = self.attr(name).and_then(parse_u32);
        if parsed.is_some() {
            self.attributes.shift_remove(name);
        }
        parsed
    }

    pub fn take_attr_i32(&mut self, name: &str) -> Option<i32> {
        let parsed = self.attr(name).and_then(|v| v.trim().parse().ok());
        if parsed.is_some() {
            self.attributes.shift_remove(name);
        }
        parsed
    }

    /// Consumes a boolean attribute spoken in the given token vocabulary
    /// (`yes`/`no`, `on`/`off`, `open`/`closed`). Any other token is left in
    /// place untouched.
    pub fn take_attr_flag(&mut self, name: &str, truthy: &str, falsy: &str) -> Option<bool> {
        let parsed = match self.attr(name) {
            Some(v) if v == truthy => Some(true),
            Some(v) if v == falsy => Some(false),
            _ => None,
        };
        if parsed.is_some() {
            self.attributes.shift_remove(name);
        }
        parsed
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child(&self, name: &str) -> Option<&XmlValue> {
        self.children.get(name)
    }

    /// The child under `name` when it is a single element node.
    pub fn child_node(&self, name: &str) -> Option<&XmlNode> {
        match self.children.get(name) {
            Some(XmlValue::Node(n)) => Some(n),
            _ => None,
        }
    }

    pub fn child_node_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        match self.children.get_mut(name) {
            Some(XmlValue::Node(n)) => Some(n),
            _ => None,
        }
    }

    pub fn take_child(&mut self, name: &str) -> Option<XmlValue> {
        self.children.shift_remove(name)
    }

    pub fn put_child(&mut self, name: &str, value: XmlValue) {
        self.children.insert(name.to_string(), value);
    }

    /// Consumes the text content of a scalar child. A plain text child is
    /// removed entirely; an element child gives up its text and is removed
    /// once nothing else is left in it.
    pub fn take_text_child(&mut self, name: &str) -> Option<String> {
        let (out, remove) = match self.children.get_mut(name)? {
            XmlValue::Text(t) => (Some(std::mem::take(t)), true),
            XmlValue::Node(n) => {
                let text = n.text.take();
                let empty = n.is_empty();
                (text, empty)
            }
            XmlValue::List(_) => (None, false),
        };
        if remove {
            self.children.shift_remove(name);
        }
        out
    }

    /// Overwrites the text of a scalar child, preserving attributes if the
    /// child is already an element node.
    pub fn set_text_child(&mut self, name: &str, text: impl Into<String>) {
        match self.children.get_mut(name) {
            Some(XmlValue::Node(n)) => n.text = Some(text.into()),
            _ => self.put_child(name, XmlValue::Text(text.into())),
        }
    }

    /// Returns the child under `name` as a mutable element node, creating it
    /// when absent and lifting a text scalar into a node. Used by encoders to
    /// merge typed fields into whatever the payload already carries.
    pub fn ensure_child(&mut self, name: &str) -> &mut XmlNode {
        let slot = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| XmlValue::Node(XmlNode::default()));
        if let XmlValue::Text(t) = slot {
            *slot = XmlValue::Node(XmlNode::from_text(std::mem::take(t)));
        }
        if let XmlValue::List(items) = slot {
            // repeated siblings are not expected for the tags encoders merge
            // into; append rather than clobber an existing entry
            items.push(XmlValue::Node(XmlNode::default()));
        }
        match slot {
            XmlValue::Node(n) => n,
            XmlValue::List(items) => match items.last_mut() {
                Some(XmlValue::Node(n)) => n,
                _ => unreachable!("a node was just appended"),
            },
            XmlValue::Text(_) => unreachable!("text scalars were lifted above"),
        }
    }

    /// Appends a value under `name`, promoting an existing single entry to a
    /// list. A fresh tag always starts out as a one-element list.
    pub fn push_child(&mut self, name: &str, value: XmlValue) {
        match self.children.get_mut(name) {
            None => {
                self.children
                    .insert(name.to_string(), XmlValue::List(vec![value]));
            }
            Some(XmlValue::List(items)) => items.push(value),
            Some(single) => {
                let prev = std::mem::replace(single, XmlValue::List(Vec::with_capacity(2)));
                if let XmlValue::List(items) = single {
                    items.push(prev);
                    items.push(value);
                }
            }
        }
    }

    /// Removes the child under `name` if extraction has emptied it.
    pub fn prune_child(&mut self, name: &str) {
        if self.children.get(name).is_some_and(XmlValue::is_empty) {
            self.children.shift_remove(name);
        }
    }

    /// Hex SHA-256 over the node's full content, in document order. Serves as
    /// the optimistic revision token for detecting lost updates.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        for (key, value) in &self.attributes {
            hasher.update([1u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
        }
        if let Some(text) = &self.text {
            hasher.update([2u8]);
            hasher.update(text.as_bytes());
        }
        for (key, value) in &self.children {
            hasher.update([3u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            value.hash_into(hasher);
        }
    }
}

impl XmlValue {
    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            XmlValue::Text(t) => {
                hasher.update([4u8]);
                hasher.update(t.as_bytes());
            }
            XmlValue::Node(n) => {
                hasher.update([5u8]);
                n.hash_into(hasher);
            }
            XmlValue::List(items) => {
                hasher.update([6u8]);
                for item in items {
                    item.hash_into(hasher);
                }
            }
        }
    }
}

/// Consumes an enumerated attribute. An unrecognized token leaves the
/// attribute in place so it survives as unknown content, and only that one
/// field stays absent.
pub(crate) fn take_token<T>(
    node: &mut XmlNode,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let parsed = node.attr(name).and_then(|t| parse(t));
    if parsed.is_some() {
        node.take_attr(name);
    }
    parsed
}

pub(crate) fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Parses XML text into a virtual document node whose children hold the root
/// element. Comments, processing instructions and the XML declaration are
/// discarded; mixed content is not supported (domain XML has none).
pub fn parse_document(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut document = XmlNode::default();
    let mut stack: Vec<(String, XmlNode)> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let (tag, node) = read_element(&e)?;
                stack.push((tag, node));
            }
            Ok(Event::Empty(e)) => {
                let (tag, node) = read_element(&e)?;
                let parent = match stack.last_mut() {
                    Some((_, n)) => n,
                    None => &mut document,
                };
                attach(parent, tag, node);
            }
            Ok(Event::Text(e)) => {
                let chunk = e
                    .unescape()
                    .map_err(|err| DomainError::XmlParsing(err.to_string()))?;
                if let Some((_, node)) = stack.last_mut() {
                    node.text.get_or_insert_with(String::new).push_str(&chunk);
                }
            }
            Ok(Event::CData(e)) => {
                let chunk = String::from_utf8_lossy(&e.into_inner()).into_owned();
                if let Some((_, node)) = stack.last_mut() {
                    node.text.get_or_insert_with(String::new).push_str(&chunk);
                }
            }
            Ok(Event::End(_)) => {
                let Some((tag, node)) = stack.pop() else {
                    return Err(DomainError::XmlParsing("unbalanced end tag".to_string()));
                };
                let parent = match stack.last_mut() {
                    Some((_, n)) => n,
                    None => &mut document,
                };
                attach(parent, tag, node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DomainError::XmlParsing(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(DomainError::XmlParsing(
            "unexpected end of document".to_string(),
        ));
    }
    Ok(document)
}

fn read_element(e: &BytesStart) -> Result<(String, XmlNode)> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut node = XmlNode::default();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| DomainError::XmlParsing(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| DomainError::XmlParsing(err.to_string()))?
            .into_owned();
        node.attributes.insert(key, value);
    }
    Ok((tag, node))
}

fn attach(parent: &mut XmlNode, tag: String, node: XmlNode) {
    // an element with nothing but text collapses to a scalar, mirroring how
    // the attribute-aware JSON view of XML represents it
    let value = if node.attributes.is_empty() && node.children.is_empty() {
        match node.text {
            Some(t) => XmlValue::Text(t),
            None => XmlValue::Node(XmlNode::default()),
        }
    } else {
        XmlValue::Node(node)
    };
    match parent.children.get_mut(&tag) {
        None => {
            parent.children.insert(tag, value);
        }
        Some(XmlValue::List(items)) => items.push(value),
        Some(single) => {
            let prev = std::mem::replace(single, XmlValue::List(Vec::with_capacity(2)));
            if let XmlValue::List(items) = single {
                items.push(prev);
                items.push(value);
            }
        }
    }
}

/// Serializes a virtual document node back to XML text.
pub fn write_document(document: &XmlNode) -> Result<String> {
    let mut buffer = Vec::new();
    let mut writer = Writer::new(&mut buffer);
    for (tag, value) in &document.children {
        write_value(&mut writer, tag, value)?;
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn write_value(writer: &mut Writer<&mut Vec<u8>>, tag: &str, value: &XmlValue) -> Result<()> {
    match value {
        XmlValue::Text(t) => {
            writer
                .write_event(Event::Start(BytesStart::new(tag)))
                .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
            writer
                .write_event(Event::Text(BytesText::new(t)))
                .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
            writer
                .write_event(Event::End(BytesEnd::new(tag)))
                .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
        }
        XmlValue::Node(node) => write_node(writer, tag, node)?,
        XmlValue::List(items) => {
            for item in items {
                write_value(writer, tag, item)?;
            }
        }
    }
    Ok(())
}

fn write_node(writer: &mut Writer<&mut Vec<u8>>, tag: &str, node: &XmlNode) -> Result<()> {
    let mut start = BytesStart::new(tag);
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    let text = node.text.as_deref().filter(|t| !t.trim().is_empty());
    if text.is_none() && node.children.is_empty() {
        writer
            .write_event(Event::Empty(start))
            .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
        return Ok(());
    }
    writer
        .write_event(Event::Start(start))
        .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
    if let Some(t) = text {
        writer
            .write_event(Event::Text(BytesText::new(t)))
            .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
    }
    for (key, value) in &node.children {
        write_value(writer, key, value)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|e| DomainError::XmlParsing(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attributes_text_and_children() {
        let doc = parse_document(
            r#"<domain type="kvm" id="7"><name>vm1</name><memory unit="KiB">1024</memory></domain>"#,
        )
        .unwrap();
        let domain = doc.child_node("domain").unwrap();
        assert_eq!(domain.attr("type"), Some("kvm"));
        assert_eq!(domain.attr("id"), Some("7"));
        assert_eq!(domain.child("name"), Some(&XmlValue::Text("vm1".to_string())));
        let memory = domain.child_node("memory").unwrap();
        assert_eq!(memory.attr("unit"), Some("KiB"));
        assert_eq!(memory.text.as_deref(), Some("1024"));
    }

    #[test]
    fn repeated_tags_promote_to_list() {
        let doc = parse_document("<devices><disk/><disk/></devices>").unwrap();
        let devices = doc.child_node("devices").unwrap();
        match devices.child("disk") {
            Some(XmlValue::List(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn single_tag_stays_single() {
        let doc = parse_document("<devices><disk/></devices>").unwrap();
        let devices = doc.child_node("devices").unwrap();
        assert!(matches!(devices.child("disk"), Some(XmlValue::Node(_))));
    }

    #[test]
    fn round_trips_through_text() {
        let xml = r#"<domain type="kvm"><name>vm1</name><devices><disk type="file"><source file="/img"/></disk><disk type="block"/></devices></domain>"#;
        let doc = parse_document(xml).unwrap();
        let rewritten = write_document(&doc).unwrap();
        assert_eq!(parse_document(&rewritten).unwrap(), doc);
    }

    #[test]
    fn escapes_special_characters() {
        let mut doc = XmlNode::default();
        let mut root = XmlNode::default();
        root.set_attr("note", "a<b&\"c\"");
        root.set_text_child("title", "tom & jerry");
        doc.put_child("domain", XmlValue::Node(root));
        let xml = write_document(&doc).unwrap();
        let reparsed = parse_document(&xml).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn take_text_child_consumes_scalar_and_element_forms() {
        let doc = parse_document("<d><name>vm1</name><vcpu placement=\"static\">2</vcpu></d>");
        let mut d = doc.unwrap().take_child("d").unwrap().into_nodes().remove(0);
        assert_eq!(d.take_text_child("name").as_deref(), Some("vm1"));
        assert!(!d.has_child("name"));
        assert_eq!(d.take_text_child("vcpu").as_deref(), Some("2"));
        // placement attribute keeps the element alive
        assert_eq!(d.child_node("vcpu").unwrap().attr("placement"), Some("static"));
    }

    #[test]
    fn empty_containers_are_pruned() {
        let mut node = XmlNode::default();
        node.put_child("memory", XmlValue::Node(XmlNode::default()));
        node.prune_child("memory");
        assert!(!node.has_child("memory"));

        node.put_child("memory", XmlValue::Text("512".to_string()));
        node.prune_child("memory");
        assert!(node.has_child("memory"));
    }

    #[test]
    fn take_attr_flag_leaves_foreign_tokens() {
        let mut node = XmlNode::default();
        node.set_attr("autoport", "maybe");
        assert_eq!(node.take_attr_flag("autoport", "yes", "no"), None);
        assert_eq!(node.attr("autoport"), Some("maybe"));

        node.set_attr("autoport", "yes");
        assert_eq!(node.take_attr_flag("autoport", "yes", "no"), Some(true));
        assert_eq!(node.attr("autoport"), None);
    }

    #[test]
    fn numeric_attributes_accept_hex() {
        let mut node = XmlNode::default();
        node.set_attr("slot", "0x03");
        node.set_attr("bus", "1");
        node.set_attr("function", "none");
        assert_eq!(node.take_attr_u32("slot"), Some(3));
        assert_eq!(node.take_attr_u32("bus"), Some(1));
        assert_eq!(node.take_attr_u32("function"), None);
        assert_eq!(node.attr("function"), Some("none"));
    }

    #[test]
    fn push_child_appends_in_order() {
        let mut node = XmlNode::default();
        node.put_child("disk", XmlValue::Text("existing".to_string()));
        node.push_child("disk", XmlValue::Text("new".to_string()));
        match node.child("disk") {
            Some(XmlValue::List(items)) => {
                assert_eq!(items[0], XmlValue::Text("existing".to_string()));
                assert_eq!(items[1], XmlValue::Text("new".to_string()));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn content_hash_tracks_changes() {
        let doc = parse_document("<domain><name>vm1</name></domain>").unwrap();
        let changed = parse_document("<domain><name>vm2</name></domain>").unwrap();
        assert_eq!(doc.content_hash(), doc.clone().content_hash());
        assert_ne!(doc.content_hash(), changed.content_hash());
    }
}
