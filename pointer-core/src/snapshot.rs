//! Structured rich-text snapshot exchanged with the editing surface and
//! the durable store.
//!
//! ```text
//! { "type": "doc", "content": [
//!     { "type": "heading", "attrs": { "level": 1 }, "content": [ { "type": "text", "text": "Title" } ] },
//!     { "type": "paragraph", "content": [ { "type": "text", "text": "Body", "marks": [ { "type": "bold" } ] } ] }
//! ] }
//! ```
//!
//! Attribute maps serialize with sorted keys, so the JSON form is canonical
//! and doubles as the input of [`Snapshot::content_hash`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Node types that may be empty without carrying content of their own.
const CONTAINER_TYPES: &[&str] = &[
    "doc",
    "paragraph",
    "heading",
    "hardBreak",
    "blockquote",
    "bulletList",
    "orderedList",
    "listItem",
    "taskList",
    "taskItem",
    "codeBlock",
];

/// Inline formatting attached to a text leaf.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
}

impl Mark {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), attrs: None }
    }
}

/// One node of the rich-text tree.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl Node {
    pub fn element(kind: impl Into<String>, content: Vec<Node>) -> Self {
        Self {
            kind: kind.into(),
            attrs: None,
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            attrs: None,
            content: Vec::new(),
            text: Some(text.into()),
            marks: Vec::new(),
        }
    }

    /// Paragraph holding a single text leaf (or nothing for `""`).
    pub fn paragraph(text: &str) -> Self {
        let content = if text.is_empty() { Vec::new() } else { vec![Node::text(text)] };
        Self::element("paragraph", content)
    }

    pub fn heading(level: u8, text: &str) -> Self {
        let mut node = Self::paragraph(text);
        node.kind = "heading".to_string();
        let mut attrs = Map::new();
        attrs.insert("level".to_string(), Value::from(level));
        node.attrs = Some(attrs);
        node
    }

    pub fn hard_break() -> Self {
        Self::element("hardBreak", Vec::new())
    }

    pub fn with_marks(mut self, marks: Vec<Mark>) -> Self {
        self.marks = marks;
        self
    }

    pub fn is_text(&self) -> bool {
        self.text.is_some()
    }

    fn is_inline(&self) -> bool {
        self.is_text() || self.kind == "hardBreak"
    }

    fn write_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
            return;
        }
        if self.kind == "hardBreak" {
            out.push('\n');
            return;
        }
        for (i, child) in self.content.iter().enumerate() {
            if i > 0 && !child.is_inline() {
                out.push_str("\n\n");
            }
            child.write_text(out);
        }
    }

    fn has_substance(&self) -> bool {
        if let Some(text) = &self.text {
            return !text.trim().is_empty();
        }
        if !CONTAINER_TYPES.contains(&self.kind.as_str()) {
            return true;
        }
        self.content.iter().any(Node::has_substance)
    }
}

/// Structural content hash (blake3 over the canonical JSON form).
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.to_string();
        write!(f, "ContentHash({})", &full[..12])
    }
}

/// A whole document tree, rooted at a `doc` node.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(transparent)]
pub struct Snapshot {
    root: Node,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::from_blocks(Vec::new())
    }

    pub fn from_blocks(blocks: Vec<Node>) -> Self {
        Self { root: Node::element("doc", blocks) }
    }

    pub fn from_paragraphs(paragraphs: &[&str]) -> Self {
        Self::from_blocks(paragraphs.iter().map(|p| Node::paragraph(p)).collect())
    }

    /// Validate and convert a JSON value.
    ///
    /// The value must be an object with a string `type` and an array
    /// `content`; anything else yields `None`.
    pub fn parse(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        object.get("type")?.as_str()?;
        object.get("content")?.as_array()?;
        let root: Node = serde_json::from_value(value.clone()).ok()?;
        Some(Self { root })
    }

    /// Like [`Snapshot::parse`], falling back to an empty document.
    pub fn parse_or_empty(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::empty(),
            Some(v) => Self::parse(v).unwrap_or_else(|| {
                log::warn!("Invalid document content format, using empty document");
                Self::empty()
            }),
        }
    }

    pub fn from_json_str(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        Self::parse(&value)
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Top-level blocks.
    pub fn blocks(&self) -> &[Node] {
        &self.root.content
    }

    pub fn into_blocks(self) -> Vec<Node> {
        self.root.content
    }

    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.root.write_text(&mut out);
        out
    }

    /// True for an all-empty document: blank text and no non-text content.
    pub fn is_empty(&self) -> bool {
        !self.root.has_substance()
    }

    pub fn has_significant_content(&self) -> bool {
        !self.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.root).unwrap_or(Value::Null)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.root).unwrap_or_default()
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_bytes(self.to_json_string().as_bytes())
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}
