//! Streaming parsers for WS-Management response bodies.
//!
//! Enumeration responses can be large (thousands of WMI instances across
//! many pulls), so the crate parses them incrementally from the HTTP body
//! stream. Three interchangeable backends implement the same contract:
//!
//! - [`TreeParser`] buffers the body and walks an owned element tree
//! - [`EventStreamParser`] replays `quick_xml` events incrementally
//! - [`TokenStreamParser`] drives a SAX-style token stream off the
//!   namespace-aware reader
//!
//! All three feed the same element-classification sink, so for any byte
//! sequence and any chunking they produce identical [`EnumerationPage`]s
//! or the same error. [`ParserKind`] selects a backend at run time.
//!
//! Shell traffic (create/command/receive/signal responses) is small and is
//! handled by the single-pass extractors in [`extract`].

pub mod extract;
pub mod sax;
pub mod stream;
pub mod tree;

pub use extract::{
    extract_command_id, extract_shell_id, parse_fault, parse_receive, FaultInfo, ReceivePayload,
};
pub use sax::TokenStreamParser;
pub use stream::EventStreamParser;
pub use tree::TreeParser;

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{WinRmError, WinRmResult};

/// One enumerated object: property name to rendered value, in document
/// order. Array-valued WMI properties arrive as repeated elements and are
/// joined with newlines.
pub type Instance = IndexMap<String, String>;

/// Parsed content of one EnumerateResponse or PullResponse.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumerationPage {
    /// Instances carried in this page
    pub instances: Vec<Instance>,
    /// Context token for the next Pull, when the server sent one
    pub context: Option<String>,
    /// Whether the server marked the enumeration complete
    pub end_of_sequence: bool,
}

/// Selects which parser backend handles enumeration response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    /// Buffer the whole body, then walk an owned element tree
    #[default]
    Tree,
    /// Incremental event replay over the accumulated body
    Events,
    /// Incremental SAX-style token stream
    Tokens,
}

impl ParserKind {
    /// Create a parser for one response body. `target_class` is the WQL
    /// target class whose elements delimit instances.
    pub fn create(&self, target_class: &str) -> Box<dyn PageParser + Send> {
        match self {
            ParserKind::Tree => Box::new(TreeParser::new(target_class)),
            ParserKind::Events => Box::new(EventStreamParser::new(target_class)),
            ParserKind::Tokens => Box::new(TokenStreamParser::new(target_class)),
        }
    }
}

/// Incremental parser for one response body. Feed body chunks as they
/// arrive, then call `finish` exactly once.
pub trait PageParser: Send {
    /// Consume the next chunk of the response body.
    fn feed(&mut self, chunk: &[u8]) -> WinRmResult<()>;

    /// Consume the end of the body and return the parsed page.
    fn finish(&mut self) -> WinRmResult<EnumerationPage>;
}

/// Parse a complete response body in one go.
pub fn parse_enumeration(
    kind: ParserKind,
    target_class: &str,
    body: &[u8],
) -> WinRmResult<EnumerationPage> {
    let mut parser = kind.create(target_class);
    parser.feed(body)?;
    parser.finish()
}

// ============================================================================
// Shared element classification
// ============================================================================

struct PropertyCapture {
    name: String,
    depth: usize,
    text: String,
    nil: bool,
}

/// Element-classification state machine shared by all parser backends.
///
/// Backends translate their reader's events into `start_element` /
/// `text` / `end_element` calls; everything WS-Management specific lives
/// here. Depth bookkeeping rather than tag names drives the state so the
/// sink never needs to remember an element stack.
pub(crate) struct ItemSink {
    target_class: String,
    depth: usize,
    seen_element: bool,
    items_depth: Option<usize>,
    skip_depth: Option<usize>,
    instance_depth: Option<usize>,
    instance: Option<Instance>,
    property: Option<PropertyCapture>,
    context_depth: Option<usize>,
    context_buf: String,
    context: Option<String>,
    end_of_sequence: bool,
    instances: Vec<Instance>,
}

impl ItemSink {
    pub(crate) fn new(target_class: &str) -> Self {
        Self {
            target_class: target_class.to_string(),
            depth: 0,
            seen_element: false,
            items_depth: None,
            skip_depth: None,
            instance_depth: None,
            instance: None,
            property: None,
            context_depth: None,
            context_buf: String::new(),
            context: None,
            end_of_sequence: false,
            instances: Vec::new(),
        }
    }

    /// An opening tag with the given namespace-local name. `nil` is true
    /// when the element carried `xsi:nil="true"`.
    pub(crate) fn start_element(&mut self, local: &str, nil: bool) {
        self.depth += 1;
        self.seen_element = true;

        if self.skip_depth.is_some() || self.property.is_some() {
            // Inside a skipped subtree or a property value; nested tags
            // carry no structure of their own.
            return;
        }

        if let Some(instance_depth) = self.instance_depth {
            if self.depth == instance_depth + 1 {
                self.property = Some(PropertyCapture {
                    name: local.to_string(),
                    depth: self.depth,
                    text: String::new(),
                    nil,
                });
            }
            return;
        }

        if let Some(items_depth) = self.items_depth {
            if self.depth == items_depth + 1 {
                if local.eq_ignore_ascii_case(&self.target_class) || local == "XmlFragment" {
                    self.instance_depth = Some(self.depth);
                    self.instance = Some(Instance::new());
                } else {
                    warn!(element = %local, "skipping unexpected element in enumeration items");
                    self.skip_depth = Some(self.depth);
                }
            }
            return;
        }

        match local {
            "Items" => self.items_depth = Some(self.depth),
            "EnumerationContext" => {
                self.context_depth = Some(self.depth);
                self.context_buf.clear();
            }
            "EndOfSequence" => self.end_of_sequence = true,
            _ => {}
        }
    }

    /// A self-closing element.
    pub(crate) fn empty_element(&mut self, local: &str, nil: bool) {
        self.start_element(local, nil);
        self.end_element();
    }

    /// Decoded character data.
    pub(crate) fn text(&mut self, decoded: &str) {
        if self.skip_depth.is_some() {
            return;
        }
        if let Some(property) = &mut self.property {
            property.text.push_str(decoded);
        } else if self.context_depth.is_some() {
            self.context_buf.push_str(decoded);
        }
    }

    /// A closing tag. The sink pairs it with the element at the current
    /// depth, so backends need not pass the name back in.
    pub(crate) fn end_element(&mut self) {
        if let Some(depth) = self.skip_depth {
            if self.depth == depth {
                self.skip_depth = None;
            }
        } else if self.property.as_ref().is_some_and(|p| p.depth == self.depth) {
            if let Some(property) = self.property.take() {
                let value = if property.nil {
                    String::new()
                } else {
                    property.text.trim().to_string()
                };
                if let Some(instance) = &mut self.instance {
                    match instance.entry(property.name) {
                        Entry::Occupied(mut entry) => {
                            let joined = entry.get_mut();
                            joined.push('\n');
                            joined.push_str(&value);
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(value);
                        }
                    }
                }
            }
        } else if self.property.is_some() {
            // Closing a nested element inside a property value.
        } else if self.instance_depth == Some(self.depth) {
            self.instance_depth = None;
            if let Some(instance) = self.instance.take() {
                self.instances.push(instance);
            }
        } else if self.items_depth == Some(self.depth) {
            self.items_depth = None;
        } else if self.context_depth == Some(self.depth) {
            self.context_depth = None;
            let token = self.context_buf.trim();
            if !token.is_empty() {
                self.context = Some(token.to_string());
            }
            self.context_buf.clear();
        }

        self.depth = self.depth.saturating_sub(1);
    }

    /// Validate completeness and hand back the page.
    pub(crate) fn finish(&mut self) -> WinRmResult<EnumerationPage> {
        if !self.seen_element {
            return Err(WinRmError::MalformedResponse(
                "response contained no XML elements".to_string(),
            ));
        }
        if self.depth != 0 {
            return Err(WinRmError::MalformedResponse(format!(
                "truncated XML response, {} elements left open",
                self.depth
            )));
        }
        Ok(EnumerationPage {
            instances: std::mem::take(&mut self.instances),
            context: self.context.take(),
            end_of_sequence: self.end_of_sequence,
        })
    }
}

/// True when an attribute's local name and value spell `xsi:nil="true"`.
pub(crate) fn is_nil_attribute(local: &[u8], value: &[u8]) -> bool {
    local == b"nil" && (value.eq_ignore_ascii_case(b"true") || value == b"1")
}

/// Namespace-local element name plus the nil marker, as the sink wants
/// them. Attribute parse errors are skipped; WMI payloads carry nothing
/// we need from a broken attribute.
pub(crate) fn element_meta(element: &quick_xml::events::BytesStart<'_>) -> (String, bool) {
    let local = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
    let nil = element
        .attributes()
        .flatten()
        .any(|attr| is_nil_attribute(attr.key.local_name().as_ref(), &attr.value));
    (local, nil)
}
