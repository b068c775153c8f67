//! Replicated document: the mergeable rich-text fragment shared by every
//! session bound to the same document identity.
//!
//! ```text
//!  editing surface ──(local)──────┐
//!                                 ▼
//!  bootstrap seed ──(bootstrap)──► Yrs Doc ── XmlFragment "default"
//!                                 ▲      │
//!  network merge ───(remote)──────┘      └──► update observers (origin, v1 bytes)
//! ```
//!
//! Blocks map to XML elements named after their node type; element
//! attributes are kept as a single JSON attribute and text leaves are XML
//! text nodes carrying their marks the same way. Every transaction is
//! tagged with an origin so listeners can tell user edits from merges.

use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, Transact, TransactionMut,
    UndoManager, Update, Xml, XmlElementPrelim, XmlFragment, XmlFragmentRef, XmlOut,
    XmlTextPrelim, XmlTextRef,
};

use crate::snapshot::{Mark, Node, Snapshot};

/// Name of the shared rich-text fragment.
pub const FRAGMENT_NAME: &str = "default";

const LOCAL_ORIGIN: &str = "local";
const REMOTE_ORIGIN: &str = "remote";
const BOOTSTRAP_ORIGIN: &str = "bootstrap";

const ATTRS_ATTRIBUTE: &str = "attrs";
const MARKS_ATTRIBUTE: &str = "marks";

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("malformed document tree: {0}")]
    Malformed(String),
    #[error("attribute serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: u32, len: u32 },
    #[error("failed to register update observer: {0}")]
    Subscribe(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Decode(e.to_string())
    }
}

/// Where a document transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Edit made through this replica's editing surface (including undo/redo).
    Local,
    /// Merge of an update received from another replica.
    Remote,
    /// One-time seed from a durable snapshot.
    Bootstrap,
}

impl UpdateOrigin {
    fn of(txn: &TransactionMut) -> Self {
        match txn.origin() {
            Some(origin) if *origin == Origin::from(REMOTE_ORIGIN) => UpdateOrigin::Remote,
            Some(origin) if *origin == Origin::from(BOOTSTRAP_ORIGIN) => UpdateOrigin::Bootstrap,
            _ => UpdateOrigin::Local,
        }
    }

    /// Whether the change came from somewhere other than the local user.
    pub fn is_programmatic(self) -> bool {
        !matches!(self, UpdateOrigin::Local)
    }
}

/// A CRDT document holding one shared rich-text fragment.
///
/// All methods take `&self`; the document is meant to be shared behind an
/// `Arc` between the editing surface and the transport.
pub struct ReplicatedDocument {
    doc: Doc,
    fragment: XmlFragmentRef,
    undo: Mutex<UndoManager>,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with a fixed client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT_NAME);
        let mut undo = UndoManager::new(&doc, &fragment);
        undo.include_origin(LOCAL_ORIGIN);
        Self {
            doc,
            fragment,
            undo: Mutex::new(undo),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Whether the shared fragment holds any block.
    pub fn has_content(&self) -> bool {
        self.block_count() > 0
    }

    pub fn block_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.fragment.len(&txn)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Structured snapshot of the fragment.
    ///
    /// Fails when the replicated tree cannot be mapped back to nodes
    /// (corrupted attributes or unexpected nesting).
    pub fn snapshot(&self) -> Result<Snapshot, CollabError> {
        let txn = self.doc.transact();
        let blocks = read_children(&txn, &self.fragment)?;
        Ok(Snapshot::from_blocks(blocks))
    }

    pub fn plain_text(&self) -> Result<String, CollabError> {
        Ok(self.snapshot()?.plain_text())
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Populate an empty fragment from a durable snapshot.
    ///
    /// Runs under the bootstrap origin and is not part of undo history.
    /// Returns the update produced by the seed.
    pub fn seed(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CollabError> {
        let mut txn = self.doc.transact_mut_with(BOOTSTRAP_ORIGIN);
        let start = self.fragment.len(&txn);
        for (i, block) in snapshot.blocks().iter().enumerate() {
            insert_node(&mut txn, &self.fragment, start + i as u32, block)?;
        }
        Ok(txn.encode_update_v1())
    }

    /// Make the fragment match `snapshot`, touching only the blocks that
    /// differ (common prefix and suffix are left in place so concurrent
    /// edits inside them still merge).
    pub fn replace_content(&self, snapshot: &Snapshot) -> Result<(), CollabError> {
        let current = self.snapshot()?.into_blocks();
        let next = snapshot.blocks();

        let prefix = current
            .iter()
            .zip(next.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = current[prefix..]
            .iter()
            .rev()
            .zip(next[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let remove_len = (current.len() - prefix - suffix) as u32;
        let inserted = &next[prefix..next.len() - suffix];
        if remove_len == 0 && inserted.is_empty() {
            return Ok(());
        }

        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        if remove_len > 0 {
            self.fragment.remove_range(&mut txn, prefix as u32, remove_len);
        }
        for (i, block) in inserted.iter().enumerate() {
            insert_node(&mut txn, &self.fragment, (prefix + i) as u32, block)?;
        }
        Ok(())
    }

    pub fn insert_block(&self, index: u32, block: &Node) -> Result<(), CollabError> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let len = self.fragment.len(&txn);
        if index > len {
            return Err(CollabError::OutOfRange { index, len });
        }
        insert_node(&mut txn, &self.fragment, index, block)
    }

    pub fn append_block(&self, block: &Node) -> Result<(), CollabError> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let len = self.fragment.len(&txn);
        insert_node(&mut txn, &self.fragment, len, block)
    }

    pub fn remove_blocks(&self, index: u32, count: u32) -> Result<(), CollabError> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let len = self.fragment.len(&txn);
        index
            .checked_add(count)
            .filter(|end| *end <= len)
            .ok_or(CollabError::OutOfRange { index, len })?;
        if count > 0 {
            self.fragment.remove_range(&mut txn, index, count);
        }
        Ok(())
    }

    /// Insert `text` at character `offset` of top-level block `block`.
    ///
    /// The text goes into the direct text leaf covering the offset; a block
    /// without text leaves gets a new one.
    pub fn insert_text(&self, block: u32, offset: u32, text: &str) -> Result<(), CollabError> {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let len = self.fragment.len(&txn);
        let element = match self.fragment.get(&txn, block) {
            Some(XmlOut::Element(element)) => element,
            Some(_) => return Err(CollabError::Malformed(format!("block {block} is not an element"))),
            None => return Err(CollabError::OutOfRange { index: block, len }),
        };

        let mut leaves: Vec<(XmlTextRef, String)> = Vec::new();
        for i in 0..element.len(&txn) {
            if let Some(XmlOut::Text(leaf)) = element.get(&txn, i) {
                let content = leaf.get_string(&txn);
                leaves.push((leaf, content));
            }
        }

        if leaves.is_empty() {
            if offset > 0 {
                return Err(CollabError::OutOfRange { index: offset, len: 0 });
            }
            let end = element.len(&txn);
            element.insert(&mut txn, end, XmlTextPrelim::new(text));
            return Ok(());
        }

        let mut start = 0u32;
        let total = leaves.len();
        for (i, (leaf, content)) in leaves.into_iter().enumerate() {
            let chars = content.chars().count() as u32;
            if offset <= start + chars || i + 1 == total {
                let local = offset.saturating_sub(start);
                if local > chars {
                    return Err(CollabError::OutOfRange { index: offset, len: start + chars });
                }
                let byte_index = content
                    .char_indices()
                    .nth(local as usize)
                    .map(|(b, _)| b)
                    .unwrap_or(content.len());
                leaf.insert(&mut txn, byte_index as u32, text);
                return Ok(());
            }
            start += chars;
        }
        Ok(())
    }

    // ── History ──────────────────────────────────────────────────

    fn undo_manager(&self) -> MutexGuard<'_, UndoManager> {
        self.undo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Revert the last local change. Remote merges are never undone.
    pub fn undo(&self) -> bool {
        self.undo_manager().undo_blocking()
    }

    pub fn redo(&self) -> bool {
        self.undo_manager().redo_blocking()
    }

    pub fn can_undo(&self) -> bool {
        self.undo_manager().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo_manager().can_redo()
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the owner of `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote_sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an update received from another replica.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| CollabError::Apply(e.to_string()))
    }

    /// Register a listener called after every committed transaction with
    /// its origin and v1-encoded update. Dropping the subscription detaches it.
    pub fn observe_updates<F>(&self, f: F) -> Result<Subscription, CollabError>
    where
        F: Fn(UpdateOrigin, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| f(UpdateOrigin::of(txn), &event.update))
            .map_err(|e| CollabError::Subscribe(format!("{e:?}")))
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_node<F: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &F,
    index: u32,
    node: &Node,
) -> Result<(), CollabError> {
    if let Some(text) = &node.text {
        let leaf = parent.insert(txn, index, XmlTextPrelim::new(text.as_str()));
        if !node.marks.is_empty() {
            leaf.insert_attribute(txn, MARKS_ATTRIBUTE, serde_json::to_string(&node.marks)?);
        }
        return Ok(());
    }

    let element = parent.insert(txn, index, XmlElementPrelim::empty(node.kind.as_str()));
    if let Some(attrs) = &node.attrs {
        element.insert_attribute(txn, ATTRS_ATTRIBUTE, serde_json::to_string(attrs)?);
    }
    for (i, child) in node.content.iter().enumerate() {
        insert_node(txn, &element, i as u32, child)?;
    }
    Ok(())
}

fn read_children<T: ReadTxn, F: XmlFragment>(txn: &T, parent: &F) -> Result<Vec<Node>, CollabError> {
    let len = parent.len(txn);
    let mut nodes = Vec::with_capacity(len as usize);
    for i in 0..len {
        match parent.get(txn, i) {
            Some(XmlOut::Element(element)) => {
                let attrs: Option<Map<String, Value>> = match element
                    .get_attribute(txn, ATTRS_ATTRIBUTE)
                    .and_then(|v| v.cast::<String>().ok())
                {
                    Some(json) => Some(serde_json::from_str(&json)?),
                    None => None,
                };
                nodes.push(Node {
                    kind: element.tag().to_string(),
                    attrs,
                    content: read_children(txn, &element)?,
                    text: None,
                    marks: Vec::new(),
                });
            }
            Some(XmlOut::Text(leaf)) => {
                let marks: Vec<Mark> = match leaf
                    .get_attribute(txn, MARKS_ATTRIBUTE)
                    .and_then(|v| v.cast::<String>().ok())
                {
                    Some(json) => serde_json::from_str(&json)?,
                    None => Vec::new(),
                };
                let mut node = Node::text(leaf.get_string(txn));
                node.marks = marks;
                nodes.push(node);
            }
            Some(XmlOut::Fragment(_)) => {
                return Err(CollabError::Malformed(format!("nested fragment at index {i}")));
            }
            None => {
                return Err(CollabError::Malformed(format!("missing child at index {i}")));
            }
        }
    }
    Ok(nodes)
}
