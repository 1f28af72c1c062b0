//! Incremental event-driven parser backend.
//!
//! Body chunks accumulate in a buffer; each feed reparses the buffer from
//! the start with a fresh reader and replays only the events past the
//! high-water mark already delivered to the sink. Reparsing costs a little
//! CPU but keeps the reader stateless across chunk boundaries, which is
//! what makes arbitrary splits (mid-tag, mid-entity) safe.
//!
//! A text event that runs to the end of the buffer may continue in the
//! next chunk, so it is withheld until either more data arrives or
//! `finish` declares the body complete. Reader errors during a feed are
//! treated as not-yet-complete input; only `finish` turns them into
//! [`WinRmError::MalformedResponse`].

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{element_meta, EnumerationPage, ItemSink, PageParser};
use crate::error::{WinRmError, WinRmResult};

pub struct EventStreamParser {
    sink: ItemSink,
    buf: Vec<u8>,
    /// Number of events already delivered to the sink.
    emitted: usize,
}

impl EventStreamParser {
    pub fn new(target_class: &str) -> Self {
        Self {
            sink: ItemSink::new(target_class),
            buf: Vec::new(),
            emitted: 0,
        }
    }

    fn apply(sink: &mut ItemSink, event: Event<'_>) -> WinRmResult<()> {
        match event {
            Event::Start(e) => {
                let (local, nil) = element_meta(&e);
                sink.start_element(&local, nil);
            }
            Event::Empty(e) => {
                let (local, nil) = element_meta(&e);
                sink.empty_element(&local, nil);
            }
            Event::End(_) => sink.end_element(),
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| {
                    WinRmError::MalformedResponse(format!("invalid character data: {e}"))
                })?;
                sink.text(&text);
            }
            Event::CData(c) => {
                let text = std::str::from_utf8(&c).map_err(|e| {
                    WinRmError::MalformedResponse(format!("invalid CDATA encoding: {e}"))
                })?;
                sink.text(text);
            }
            _ => {}
        }
        Ok(())
    }

    fn drain(&mut self, at_end: bool) -> WinRmResult<()> {
        let mut reader = Reader::from_reader(self.buf.as_slice());
        let mut scratch = Vec::new();
        let mut index = 0usize;
        // Character data is only trusted once a following event proves it
        // ended at real markup; text cut short by the buffer edge would
        // otherwise be delivered in halves.
        let mut held: Option<Event<'static>> = None;

        loop {
            scratch.clear();
            match reader.read_event_into(&mut scratch) {
                Ok(Event::Eof) => {
                    if let Some(event) = held.take() {
                        if !at_end {
                            // May continue in the next chunk.
                            return Ok(());
                        }
                        Self::apply(&mut self.sink, event)?;
                        self.emitted = index;
                    }
                    return Ok(());
                }
                Ok(event) => {
                    if let Some(prev) = held.take() {
                        match Self::apply(&mut self.sink, prev) {
                            Ok(()) => self.emitted = index,
                            Err(e) if at_end => return Err(e),
                            Err(_) => return Ok(()),
                        }
                    }
                    if index < self.emitted {
                        index += 1;
                        continue;
                    }
                    if matches!(event, Event::Text(_) | Event::CData(_)) {
                        held = Some(event.into_owned());
                        index += 1;
                        continue;
                    }
                    match Self::apply(&mut self.sink, event) {
                        Ok(()) => {
                            index += 1;
                            self.emitted = index;
                        }
                        Err(e) if at_end => return Err(e),
                        Err(_) => return Ok(()),
                    }
                }
                Err(e) if at_end => {
                    return Err(WinRmError::MalformedResponse(format!(
                        "invalid XML in response: {e}"
                    )));
                }
                // Most likely markup split across a chunk boundary; wait
                // for more data. Held text is withheld with it: the text
                // in front of incomplete markup reparses identically.
                Err(_) => return Ok(()),
            }
        }
    }
}

impl PageParser for EventStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> WinRmResult<()> {
        self.buf.extend_from_slice(chunk);
        self.drain(false)
    }

    fn finish(&mut self) -> WinRmResult<EnumerationPage> {
        self.drain(true)?;
        self.sink.finish()
    }
}
