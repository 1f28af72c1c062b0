//! Incremental SAX-style parser backend.
//!
//! Like [`super::stream::EventStreamParser`] this backend reparses the
//! accumulated buffer on every feed, but it runs the namespace-aware
//! reader and lowers its events into a flat token stream first; a second
//! stage dispatches tokens to the classification sink. The split mirrors
//! a classic SAX pipeline: lexing and handling stay separate.
//!
//! Trailing character data is only trusted once the reader has produced a
//! further event after it. A text token that ends exactly at the buffer
//! edge is withheld until more data arrives or `finish` runs.

use quick_xml::events::Event;
use quick_xml::NsReader;

use super::{element_meta, EnumerationPage, ItemSink, PageParser};
use crate::error::{WinRmError, WinRmResult};

/// One lexical unit of the document.
enum XmlToken {
    Open { local: String, nil: bool },
    Close,
    Empty { local: String, nil: bool },
    Text(String),
}

/// Why tokenization stopped walking the buffer.
enum Stop {
    Eof,
    Error(String),
}

pub struct TokenStreamParser {
    sink: ItemSink,
    buf: Vec<u8>,
    /// Number of reader events already dispatched to the sink.
    emitted: usize,
}

impl TokenStreamParser {
    pub fn new(target_class: &str) -> Self {
        Self {
            sink: ItemSink::new(target_class),
            buf: Vec::new(),
            emitted: 0,
        }
    }

    /// Lower one reader event into a token. `None` for events with no
    /// lexical significance to the sink (declarations, comments, PIs).
    fn tokenize(event: Event<'_>) -> WinRmResult<Option<XmlToken>> {
        let token = match event {
            Event::Start(e) => {
                let (local, nil) = element_meta(&e);
                Some(XmlToken::Open { local, nil })
            }
            Event::Empty(e) => {
                let (local, nil) = element_meta(&e);
                Some(XmlToken::Empty { local, nil })
            }
            Event::End(_) => Some(XmlToken::Close),
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| {
                    WinRmError::MalformedResponse(format!("invalid character data: {e}"))
                })?;
                Some(XmlToken::Text(text.into_owned()))
            }
            Event::CData(c) => {
                let text = std::str::from_utf8(&c).map_err(|e| {
                    WinRmError::MalformedResponse(format!("invalid CDATA encoding: {e}"))
                })?;
                Some(XmlToken::Text(text.to_string()))
            }
            _ => None,
        };
        Ok(token)
    }

    fn dispatch(sink: &mut ItemSink, token: XmlToken) {
        match token {
            XmlToken::Open { local, nil } => sink.start_element(&local, nil),
            XmlToken::Close => sink.end_element(),
            XmlToken::Empty { local, nil } => sink.empty_element(&local, nil),
            XmlToken::Text(text) => sink.text(&text),
        }
    }

    fn drain(&mut self, at_end: bool) -> WinRmResult<()> {
        let mut reader = NsReader::from_reader(self.buf.as_slice());
        let mut scratch = Vec::new();
        let mut index = 0usize;
        // Tokens for events past the high-water mark, one slot per event.
        let mut pending: Vec<Option<XmlToken>> = Vec::new();

        let stop = loop {
            scratch.clear();
            match reader.read_resolved_event_into(&mut scratch) {
                Ok((_, Event::Eof)) => break Stop::Eof,
                Ok((_, event)) => {
                    if index < self.emitted {
                        index += 1;
                        continue;
                    }
                    match Self::tokenize(event) {
                        Ok(slot) => {
                            pending.push(slot);
                            index += 1;
                        }
                        Err(WinRmError::MalformedResponse(msg)) => break Stop::Error(msg),
                        Err(e) => break Stop::Error(e.to_string()),
                    }
                }
                Err(e) => break Stop::Error(e.to_string()),
            }
        };

        let mut deliverable = pending.len();
        match stop {
            Stop::Error(e) if at_end => {
                return Err(WinRmError::MalformedResponse(format!(
                    "invalid XML in response: {e}"
                )));
            }
            // On a non-final drain the walk stopped at the buffer edge,
            // either cleanly (Eof) or inside split markup (Error). Either
            // way a trailing text token is not yet trustworthy: the next
            // chunk may extend it, and a reparse would then see a longer
            // merged event at its index. Withhold it; everything before
            // it is complete.
            Stop::Eof | Stop::Error(_) => {
                if !at_end && matches!(pending.last(), Some(Some(XmlToken::Text(_)))) {
                    deliverable -= 1;
                }
            }
        }

        for slot in pending.drain(..deliverable) {
            if let Some(token) = slot {
                Self::dispatch(&mut self.sink, token);
            }
            self.emitted += 1;
        }
        Ok(())
    }
}

impl PageParser for TokenStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> WinRmResult<()> {
        self.buf.extend_from_slice(chunk);
        self.drain(false)
    }

    fn finish(&mut self) -> WinRmResult<EnumerationPage> {
        self.drain(true)?;
        self.sink.finish()
    }
}
