//! Buffered-tree parser backend.
//!
//! Accumulates the whole response body, parses it into an owned element
//! tree in one pass, then replays the tree into the shared classification
//! sink. The simplest backend and the reference the incremental ones are
//! checked against.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{element_meta, EnumerationPage, ItemSink, PageParser};
use crate::error::{WinRmError, WinRmResult};

enum Node {
    Element {
        local: String,
        nil: bool,
        children: Vec<Node>,
    },
    Text(String),
}

pub struct TreeParser {
    sink: ItemSink,
    buf: Vec<u8>,
}

impl TreeParser {
    pub fn new(target_class: &str) -> Self {
        Self {
            sink: ItemSink::new(target_class),
            buf: Vec::new(),
        }
    }

    fn build(bytes: &[u8]) -> WinRmResult<Vec<Node>> {
        let mut reader = Reader::from_reader(bytes);
        let mut scratch = Vec::new();
        // Stack of elements whose end tag has not arrived yet.
        let mut open: Vec<Node> = Vec::new();
        let mut roots: Vec<Node> = Vec::new();

        fn attach(open: &mut [Node], roots: &mut Vec<Node>, node: Node) {
            match open.last_mut() {
                Some(Node::Element { children, .. }) => children.push(node),
                _ => roots.push(node),
            }
        }

        loop {
            scratch.clear();
            match reader.read_event_into(&mut scratch) {
                Ok(Event::Start(e)) => {
                    let (local, nil) = element_meta(&e);
                    open.push(Node::Element {
                        local,
                        nil,
                        children: Vec::new(),
                    });
                }
                Ok(Event::Empty(e)) => {
                    let (local, nil) = element_meta(&e);
                    attach(
                        &mut open,
                        &mut roots,
                        Node::Element {
                            local,
                            nil,
                            children: Vec::new(),
                        },
                    );
                }
                Ok(Event::End(_)) => {
                    let node = open.pop().ok_or_else(|| {
                        WinRmError::MalformedResponse(
                            "unmatched closing tag in response".to_string(),
                        )
                    })?;
                    attach(&mut open, &mut roots, node);
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| {
                        WinRmError::MalformedResponse(format!("invalid character data: {e}"))
                    })?;
                    attach(&mut open, &mut roots, Node::Text(text.into_owned()));
                }
                Ok(Event::CData(c)) => {
                    let text = std::str::from_utf8(&c).map_err(|e| {
                        WinRmError::MalformedResponse(format!("invalid CDATA encoding: {e}"))
                    })?;
                    attach(&mut open, &mut roots, Node::Text(text.to_string()));
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(WinRmError::MalformedResponse(format!(
                        "invalid XML in response: {e}"
                    )));
                }
            }
        }

        if !open.is_empty() {
            return Err(WinRmError::MalformedResponse(format!(
                "truncated XML response, {} elements left open",
                open.len()
            )));
        }
        Ok(roots)
    }

    fn replay(sink: &mut ItemSink, node: &Node) {
        match node {
            Node::Element {
                local,
                nil,
                children,
            } => {
                sink.start_element(local, *nil);
                for child in children {
                    Self::replay(sink, child);
                }
                sink.end_element();
            }
            Node::Text(text) => sink.text(text),
        }
    }
}

impl PageParser for TreeParser {
    fn feed(&mut self, chunk: &[u8]) -> WinRmResult<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self) -> WinRmResult<EnumerationPage> {
        let roots = Self::build(&self.buf)?;
        for node in &roots {
            Self::replay(&mut self.sink, node);
        }
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_in_pieces_matches_single_feed() {
        let body = br#"<Envelope><Body><Items><Win32_Service><Name>Spooler</Name></Win32_Service></Items><EndOfSequence/></Body></Envelope>"#;

        let mut whole = TreeParser::new("Win32_Service");
        whole.feed(body).unwrap();
        let whole = whole.finish().unwrap();

        let mut pieces = TreeParser::new("Win32_Service");
        for chunk in body.chunks(7) {
            pieces.feed(chunk).unwrap();
        }
        let pieces = pieces.finish().unwrap();

        assert_eq!(whole, pieces);
        assert_eq!(whole.instances[0]["Name"], "Spooler");
    }

    #[test]
    fn test_cdata_property_value() {
        let body = br#"<E><Items><Win32_Service><Cmd><![CDATA[a < b & c]]></Cmd></Win32_Service></Items><EndOfSequence/></E>"#;
        let mut parser = TreeParser::new("Win32_Service");
        parser.feed(body).unwrap();
        let page = parser.finish().unwrap();
        assert_eq!(page.instances[0]["Cmd"], "a < b & c");
    }
}
