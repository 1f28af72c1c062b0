//! Golden-output tests for the envelope factory.
//!
//! Envelopes are pure functions of the connection parameters and the
//! per-call arguments, so with a fixed message id the full rendered
//! document can be compared against a golden string.

use pretty_assertions::assert_eq;
use uuid::Uuid;
use winrm_client::{Auth, ConnectionInfo, EnvelopeFactory};

fn factory() -> EnvelopeFactory {
    EnvelopeFactory::new(&ConnectionInfo::new(
        "srv1.example.com",
        Auth::basic("admin", "pw"),
    ))
}

fn fixed_id() -> Uuid {
    Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap()
}

#[test]
fn test_golden_enumerate_envelope() {
    let envelope = factory()
        .enumerate(
            fixed_id(),
            "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/*",
            "SELECT Name FROM Win32_Service",
            100,
        )
        .unwrap();

    let expected = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd" xmlns:wsen="http://schemas.xmlsoap.org/ws/2004/09/enumeration" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <s:Header>
    <a:To>http://srv1.example.com:5985/wsman</a:To>
    <w:ResourceURI s:mustUnderstand="true">http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/*</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate</a:Action>
    <a:MessageID>uuid:11111111-2222-3333-4444-555555555555</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT60S</w:OperationTimeout>
    <w:Locale xml:lang="en-US" s:mustUnderstand="false"/>
    <p:DataLocale xml:lang="en-US" s:mustUnderstand="false"/>
  </s:Header>
  <s:Body>
    <wsen:Enumerate>
      <w:OptimizeEnumeration/>
      <w:MaxElements>100</w:MaxElements>
      <w:Filter Dialect="http://schemas.microsoft.com/wbem/wsman/1/WQL">SELECT Name FROM Win32_Service</w:Filter>
    </wsen:Enumerate>
  </s:Body>
</s:Envelope>"#;

    assert_eq!(envelope, expected);
}

#[test]
fn test_golden_receive_envelope() {
    let envelope = factory().receive(fixed_id(), "SHELL-1", "CMD-9");

    let expected = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd" xmlns:wsen="http://schemas.xmlsoap.org/ws/2004/09/enumeration" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <s:Header>
    <a:To>http://srv1.example.com:5985/wsman</a:To>
    <w:ResourceURI s:mustUnderstand="true">http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive</a:Action>
    <a:MessageID>uuid:11111111-2222-3333-4444-555555555555</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT60S</w:OperationTimeout>
    <w:Locale xml:lang="en-US" s:mustUnderstand="false"/>
    <p:DataLocale xml:lang="en-US" s:mustUnderstand="false"/>
    <w:SelectorSet>
      <w:Selector Name="ShellId">SHELL-1</w:Selector>
    </w:SelectorSet>
  </s:Header>
  <s:Body>
    <rsp:Receive>
      <rsp:DesiredStream CommandId="CMD-9">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  </s:Body>
</s:Envelope>"#;

    assert_eq!(envelope, expected);
}

#[test]
fn test_identical_inputs_render_identical_envelopes() {
    let factory = factory();
    let a = factory.create_shell(fixed_id());
    let b = factory.create_shell(fixed_id());
    assert_eq!(a, b);

    let a = factory.signal(
        fixed_id(),
        "SHELL-1",
        "CMD-9",
        winrm_client::SignalCode::Terminate,
    );
    let b = factory.signal(
        fixed_id(),
        "SHELL-1",
        "CMD-9",
        winrm_client::SignalCode::Terminate,
    );
    assert_eq!(a, b);
}
