//! XML document model and writer for the exported graph
//!
//! A small element tree plus the protocol constructors for every node kind
//! the graph document uses. The writer produces standalone UTF-8 XML with
//! two-space indentation.

use std::io::{self, Write};

/// An element node: name, attributes in insertion order, child elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    /// Child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child element with the given name.
    pub fn child_named(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn write_indented(&self, w: &mut impl Write, depth: usize) -> io::Result<()> {
        let pad = "  ".repeat(depth);
        write!(w, "{pad}<{}", self.name)?;
        for (key, value) in &self.attributes {
            write!(w, " {key}=\"{}\"", escape(value))?;
        }
        if self.children.is_empty() {
            writeln!(w, "/>")
        } else {
            writeln!(w, ">")?;
            for child in &self.children {
                child.write_indented(w, depth + 1)?;
            }
            writeln!(w, "{pad}</{}>", self.name)
        }
    }
}

/// Serialise a document: XML declaration plus the root element.
pub fn write_document(root: &XmlElement, w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>")?;
    root.write_indented(w, 0)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn document_root() -> XmlElement {
    XmlElement::new("classflow")
}

pub fn method_element(id: &str) -> XmlElement {
    XmlElement::new("method").with_attr("id", id)
}

pub fn parameters_element() -> XmlElement {
    XmlElement::new("parameters")
}

pub fn parameter_element(id: &str, ty: &str) -> XmlElement {
    XmlElement::new("parameter").with_attr("id", id).with_attr("type", ty)
}

pub fn insns_element() -> XmlElement {
    XmlElement::new("insns")
}

pub fn insn_element(opcode: u8, line: i32, id: &str) -> XmlElement {
    XmlElement::new("insn")
        .with_attr("opcode", opcode.to_string())
        .with_attr("line", line.to_string())
        .with_attr("id", id)
}

pub fn field_element(owner: &str, name: &str) -> XmlElement {
    XmlElement::new("field").with_attr("owner", owner).with_attr("name", name)
}

pub fn inputs_element() -> XmlElement {
    XmlElement::new("inputs")
}

pub fn value_of_element(from: &str) -> XmlElement {
    XmlElement::new("value-of").with_attr("from", from)
}

pub fn merge_element() -> XmlElement {
    XmlElement::new("merge")
}

pub fn unknown_element() -> XmlElement {
    XmlElement::new("unknown")
}

pub fn call_target_element(id: &str) -> XmlElement {
    XmlElement::new("call-target").with_attr("id", id)
}

pub fn exits_element() -> XmlElement {
    XmlElement::new("exits")
}

pub fn exit_element(to: &str, exceptional: bool) -> XmlElement {
    XmlElement::new("exit")
        .with_attr("to", to)
        .with_attr("exceptional", exceptional.to_string())
}
