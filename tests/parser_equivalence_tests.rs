//! Conformance suite for the three parser backends.
//!
//! Every backend must produce the same page (or the same class of error)
//! for the same response bytes, regardless of how the body is split into
//! chunks. The buffered tree backend is the reference; the incremental
//! backends are checked against it over a range of adversarial chunkings.

use pretty_assertions::assert_eq;
use winrm_client::parser::{parse_enumeration, EnumerationPage, ParserKind};
use winrm_client::WinRmError;

const ALL_KINDS: [ParserKind; 3] = [ParserKind::Tree, ParserKind::Events, ParserKind::Tokens];

const ENUMERATE_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:wsen="http://schemas.xmlsoap.org/ws/2004/09/enumeration"
            xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd"
            xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service"
            xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <s:Body>
    <wsen:EnumerateResponse>
      <wsen:EnumerationContext>uuid:77df62f8-6c53-43a5-81b2-5e6a7a03d2a1</wsen:EnumerationContext>
      <w:Items>
        <p:Win32_Service>
          <p:Name>Spooler</p:Name>
          <p:DisplayName>Print Spooler</p:DisplayName>
          <p:State>Running</p:State>
          <p:PathName>C:\Windows\System32\spoolsv.exe</p:PathName>
        </p:Win32_Service>
        <p:Win32_Service>
          <p:Name>W32Time</p:Name>
          <p:DisplayName>Windows Time &amp; Sync</p:DisplayName>
          <p:State>Stopped</p:State>
          <p:PathName xsi:nil="true"/>
        </p:Win32_Service>
      </w:Items>
    </wsen:EnumerateResponse>
  </s:Body>
</s:Envelope>"#;

const PULL_FINAL_RESPONSE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:wsen="http://schemas.xmlsoap.org/ws/2004/09/enumeration"
            xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd"
            xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service">
  <s:Body>
    <wsen:PullResponse>
      <wsen:Items>
        <p:Win32_Service>
          <p:Name>EventLog</p:Name>
          <p:Dependencies>RPCSS</p:Dependencies>
          <p:Dependencies>DcomLaunch</p:Dependencies>
        </p:Win32_Service>
      </wsen:Items>
      <wsen:EndOfSequence/>
    </wsen:PullResponse>
  </s:Body>
</s:Envelope>"#;

const XML_FRAGMENT_RESPONSE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <PullResponse>
      <Items>
        <XmlFragment>Name = "lsass.exe"<PercentProcessorTime>3</PercentProcessorTime></XmlFragment>
        <XmlFragment><PercentProcessorTime>41</PercentProcessorTime></XmlFragment>
      </Items>
      <EndOfSequence></EndOfSequence>
    </PullResponse>
  </s:Body>
</s:Envelope>"#;

fn feed_in_chunks(kind: ParserKind, body: &[u8], chunk_len: usize) -> EnumerationPage {
    let mut parser = kind.create("Win32_Service");
    for chunk in body.chunks(chunk_len) {
        parser.feed(chunk).unwrap();
    }
    parser.finish().unwrap()
}

#[test]
fn test_all_backends_agree_on_whole_bodies() {
    for body in [ENUMERATE_RESPONSE, PULL_FINAL_RESPONSE, XML_FRAGMENT_RESPONSE] {
        let reference =
            parse_enumeration(ParserKind::Tree, "Win32_Service", body.as_bytes()).unwrap();
        for kind in ALL_KINDS {
            let page = parse_enumeration(kind, "Win32_Service", body.as_bytes()).unwrap();
            assert_eq!(page, reference, "{kind:?}");
        }
    }
}

#[test]
fn test_all_backends_agree_under_every_chunking() {
    for body in [ENUMERATE_RESPONSE, PULL_FINAL_RESPONSE, XML_FRAGMENT_RESPONSE] {
        let reference =
            parse_enumeration(ParserKind::Tree, "Win32_Service", body.as_bytes()).unwrap();
        for kind in ALL_KINDS {
            for chunk_len in [1, 2, 3, 7, 16, 61, 256, body.len()] {
                let page = feed_in_chunks(kind, body.as_bytes(), chunk_len);
                assert_eq!(page, reference, "{kind:?} chunk_len={chunk_len}");
            }
        }
    }
}

#[test]
fn test_split_inside_entity_reference() {
    // "&amp;" in the W32Time display name, severed right after the '&'.
    let split = ENUMERATE_RESPONSE.find("&amp;").unwrap() + 1;
    let (a, b) = ENUMERATE_RESPONSE.as_bytes().split_at(split);

    for kind in ALL_KINDS {
        let mut parser = kind.create("Win32_Service");
        parser.feed(a).unwrap();
        parser.feed(b).unwrap();
        let page = parser.finish().unwrap();
        assert_eq!(
            page.instances[1]["DisplayName"], "Windows Time & Sync",
            "{kind:?}"
        );
    }
}

#[test]
fn test_split_inside_tag_name() {
    let split = ENUMERATE_RESPONSE.find("<p:DisplayName>").unwrap() + 6;
    let (a, b) = ENUMERATE_RESPONSE.as_bytes().split_at(split);

    let reference =
        parse_enumeration(ParserKind::Tree, "Win32_Service", ENUMERATE_RESPONSE.as_bytes())
            .unwrap();
    for kind in ALL_KINDS {
        let mut parser = kind.create("Win32_Service");
        parser.feed(a).unwrap();
        parser.feed(b).unwrap();
        assert_eq!(parser.finish().unwrap(), reference, "{kind:?}");
    }
}

#[test]
fn test_extracted_page_content_is_what_the_server_sent() {
    let page = parse_enumeration(
        ParserKind::Tree,
        "Win32_Service",
        ENUMERATE_RESPONSE.as_bytes(),
    )
    .unwrap();

    assert_eq!(
        page.context.as_deref(),
        Some("uuid:77df62f8-6c53-43a5-81b2-5e6a7a03d2a1")
    );
    assert!(!page.end_of_sequence);
    assert_eq!(page.instances.len(), 2);
    assert_eq!(page.instances[0]["Name"], "Spooler");
    assert_eq!(
        page.instances[0]["PathName"],
        r"C:\Windows\System32\spoolsv.exe"
    );
    // xsi:nil properties render as empty values.
    assert_eq!(page.instances[1]["PathName"], "");

    let last = parse_enumeration(
        ParserKind::Tree,
        "Win32_Service",
        PULL_FINAL_RESPONSE.as_bytes(),
    )
    .unwrap();
    assert!(last.end_of_sequence);
    assert_eq!(last.context, None);
    // Repeated properties join as a multi-line value.
    assert_eq!(last.instances[0]["Dependencies"], "RPCSS\nDcomLaunch");
}

#[test]
fn test_xml_fragment_items_form_instances() {
    let page = parse_enumeration(
        ParserKind::Tokens,
        "Win32_Process",
        XML_FRAGMENT_RESPONSE.as_bytes(),
    )
    .unwrap();
    assert_eq!(page.instances.len(), 2);
    assert_eq!(page.instances[0]["PercentProcessorTime"], "3");
    assert_eq!(page.instances[1]["PercentProcessorTime"], "41");
    assert!(page.end_of_sequence);
}

#[test]
fn test_all_backends_reject_truncated_bodies() {
    let truncated = &ENUMERATE_RESPONSE.as_bytes()[..ENUMERATE_RESPONSE.len() / 2];
    for kind in ALL_KINDS {
        let err = parse_enumeration(kind, "Win32_Service", truncated).unwrap_err();
        assert!(matches!(err, WinRmError::MalformedResponse(_)), "{kind:?}");
    }
}

#[test]
fn test_all_backends_reject_empty_and_non_xml_bodies() {
    for kind in ALL_KINDS {
        assert!(matches!(
            parse_enumeration(kind, "Win32_Service", b"").unwrap_err(),
            WinRmError::MalformedResponse(_)
        ));
        assert!(matches!(
            parse_enumeration(kind, "Win32_Service", b"<a></b>").unwrap_err(),
            WinRmError::MalformedResponse(_)
        ));
    }
}
