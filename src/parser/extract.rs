//! Single-pass extractors for shell traffic and SOAP faults.
//!
//! Shell responses are small, so these helpers take the buffered body and
//! pull out the handful of values the shell client needs. Fault scanning
//! is deliberately lenient: a fault body we cannot fully parse still
//! yields whatever reason text was found.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;

use crate::error::{WinRmError, WinRmResult};

/// WSManFault code the server sends when the addressed shell no longer
/// exists (for example after a service restart).
pub const FAULT_CODE_SHELL_NOT_FOUND: u64 = 2_150_858_843;

/// WSManFault code for an expired `OperationTimeout` on a Receive that
/// had no output to deliver. Benign; the caller re-issues the Receive.
pub const FAULT_CODE_OPERATION_TIMEOUT: u64 = 2_150_858_793;

/// Details of a SOAP fault body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    /// Human-readable reason (`s:Reason/s:Text`, or `faultstring`)
    pub reason: String,
    /// Numeric WSManFault code, when present
    pub code: Option<u64>,
    /// Provider detail message (`MSFT_WmiError`/`WSManFault` `Message`)
    pub detail: Option<String>,
}

impl FaultInfo {
    /// Whether this fault is the invalidated-shell signature.
    pub fn is_shell_not_found(&self) -> bool {
        self.code == Some(FAULT_CODE_SHELL_NOT_FOUND)
            || self.contains_text("shell was not found")
    }

    /// Whether this fault is the benign receive-timeout signature.
    pub fn is_operation_timeout(&self) -> bool {
        self.code == Some(FAULT_CODE_OPERATION_TIMEOUT)
    }

    fn contains_text(&self, needle: &str) -> bool {
        self.reason.to_ascii_lowercase().contains(needle)
            || self
                .detail
                .as_ref()
                .is_some_and(|d| d.to_ascii_lowercase().contains(needle))
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(detail) = &self.detail {
            if detail != &self.reason {
                write!(f, " ({})", detail)?;
            }
        }
        Ok(())
    }
}

fn local_of(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// Scan a response body for a SOAP fault. Returns `None` when the body
/// contains no fault markers at all.
pub fn parse_fault(body: &str) -> Option<FaultInfo> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();
    let mut fault_seen = false;
    let mut reason: Option<String> = None;
    let mut faultstring: Option<String> = None;
    let mut detail: Option<String> = None;
    let mut code: Option<u64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_of(&e);
                if local == "Fault" {
                    fault_seen = true;
                } else if local == "WSManFault" {
                    fault_seen = true;
                    if code.is_none() {
                        code = attribute(&e, "Code").and_then(|v| v.parse().ok());
                    }
                }
                stack.push(local);
            }
            Ok(Event::Empty(e)) => {
                if local_of(&e) == "WSManFault" {
                    fault_seen = true;
                    if code.is_none() {
                        code = attribute(&e, "Code").and_then(|v| v.parse().ok());
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match stack.last().map(String::as_str) {
                        Some("Text") if reason.is_none() => reason = Some(text.to_string()),
                        Some("faultstring") if faultstring.is_none() => {
                            faultstring = Some(text.to_string())
                        }
                        Some("Message") if detail.is_none() => detail = Some(text.to_string()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            // Best effort: report what was found before the parse broke.
            Err(_) => break,
        }
    }

    if !fault_seen && reason.is_none() && faultstring.is_none() && code.is_none() {
        return None;
    }
    let reason = reason
        .or(faultstring)
        .or_else(|| detail.clone())
        .unwrap_or_else(|| "unknown SOAP fault".to_string());
    Some(FaultInfo {
        reason,
        code,
        detail,
    })
}

/// Pull the shell id out of a CreateResponse. Servers answer with either
/// a `rsp:ShellId` element or a `Selector Name="ShellId"` in the endpoint
/// reference.
pub fn extract_shell_id(body: &str) -> WinRmResult<String> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();
    let mut in_shell_selector = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_of(&e);
                if local == "Selector" && attribute(&e, "Name").as_deref() == Some("ShellId") {
                    in_shell_selector = true;
                }
                stack.push(local);
            }
            Ok(Event::Text(t)) => {
                let capture = match stack.last().map(String::as_str) {
                    Some("ShellId") => true,
                    Some("Selector") => in_shell_selector,
                    _ => false,
                };
                if capture {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim();
                        if !text.is_empty() {
                            return Ok(text.to_string());
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                if stack.pop().as_deref() == Some("Selector") {
                    in_shell_selector = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(WinRmError::MalformedResponse(format!(
                    "invalid shell create response: {e}"
                )));
            }
        }
    }

    Err(WinRmError::MalformedResponse(
        "no shell id in create response".to_string(),
    ))
}

/// Pull the command id out of a CommandResponse.
pub fn extract_command_id(body: &str) -> WinRmResult<String> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(local_of(&e)),
            Ok(Event::Text(t)) => {
                if stack.last().map(String::as_str) == Some("CommandId") {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim();
                        if !text.is_empty() {
                            return Ok(text.to_string());
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(WinRmError::MalformedResponse(format!(
                    "invalid command response: {e}"
                )));
            }
        }
    }

    Err(WinRmError::MalformedResponse(
        "no command id in command response".to_string(),
    ))
}

/// Decoded content of one ReceiveResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivePayload {
    /// Raw stdout bytes decoded from the base64 stream blocks
    pub stdout: Vec<u8>,
    /// Raw stderr bytes decoded from the base64 stream blocks
    pub stderr: Vec<u8>,
    /// Whether the command state reached Done
    pub done: bool,
    /// Exit code, present once the command is done
    pub exit_code: Option<i32>,
}

/// Parse a ReceiveResponse: decode the stdout/stderr stream blocks in
/// document order and note command completion.
pub fn parse_receive(body: &str) -> WinRmResult<ReceivePayload> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();
    let mut current_stream: Option<String> = None;
    let mut payload = ReceivePayload::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_of(&e);
                match local.as_str() {
                    "Stream" => current_stream = attribute(&e, "Name"),
                    "CommandState" => {
                        if attribute(&e, "State").is_some_and(|s| s.ends_with("Done")) {
                            payload.done = true;
                        }
                    }
                    _ => {}
                }
                stack.push(local);
            }
            Ok(Event::Empty(e)) => {
                if local_of(&e) == "CommandState"
                    && attribute(&e, "State").is_some_and(|s| s.ends_with("Done"))
                {
                    payload.done = true;
                }
            }
            Ok(Event::Text(t)) => match stack.last().map(String::as_str) {
                Some("Stream") => {
                    let text = t.unescape().map_err(|e| {
                        WinRmError::MalformedResponse(format!("invalid stream block: {e}"))
                    })?;
                    let decoded = BASE64_STANDARD.decode(text.trim()).map_err(|e| {
                        WinRmError::MalformedResponse(format!(
                            "stream block is not valid base64: {e}"
                        ))
                    })?;
                    match current_stream.as_deref() {
                        Some("stdout") => payload.stdout.extend_from_slice(&decoded),
                        Some("stderr") => payload.stderr.extend_from_slice(&decoded),
                        _ => {}
                    }
                }
                Some("ExitCode") => {
                    if let Ok(text) = t.unescape() {
                        payload.exit_code = text.trim().parse().ok();
                    }
                }
                _ => {}
            },
            Ok(Event::End(_)) => {
                if stack.pop().as_deref() == Some("Stream") {
                    current_stream = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(WinRmError::MalformedResponse(format!(
                    "invalid receive response: {e}"
                )));
            }
        }
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_fault_reason_and_code() {
        let body = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
          <s:Body><s:Fault>
            <s:Reason><s:Text xml:lang="en-US">The WS-Management service cannot process the request.</s:Text></s:Reason>
            <s:Detail>
              <f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858843" Machine="srv1">
                <f:Message>The request for the Windows Remote Shell with ShellId xyz failed because the shell was not found on the server.</f:Message>
              </f:WSManFault>
            </s:Detail>
          </s:Fault></s:Body>
        </s:Envelope>"#;

        let fault = parse_fault(body).unwrap();
        assert_eq!(
            fault.reason,
            "The WS-Management service cannot process the request."
        );
        assert_eq!(fault.code, Some(FAULT_CODE_SHELL_NOT_FOUND));
        assert!(fault.is_shell_not_found());
        assert!(!fault.is_operation_timeout());
        assert!(fault.detail.as_ref().unwrap().contains("shell was not found"));
    }

    #[test]
    fn test_parse_fault_faultstring_fallback() {
        let body = "<Envelope><Body><Fault><faultstring>Access is denied.</faultstring></Fault></Body></Envelope>";
        let fault = parse_fault(body).unwrap();
        assert_eq!(fault.reason, "Access is denied.");
        assert_eq!(fault.code, None);
    }

    #[test]
    fn test_parse_fault_absent() {
        assert_eq!(parse_fault("<Envelope><Body/></Envelope>"), None);
        assert_eq!(parse_fault("plain text error page"), None);
    }

    #[test]
    fn test_extract_shell_id_from_element_and_selector() {
        let via_element =
            "<E><Body><Shell><ShellId>4F560B4C-5B87</ShellId></Shell></Body></E>";
        assert_eq!(extract_shell_id(via_element).unwrap(), "4F560B4C-5B87");

        let via_selector = r#"<E><Body><ResourceCreated>
            <ReferenceParameters><SelectorSet>
              <Selector Name="ShellId">9A1C-44</Selector>
            </SelectorSet></ReferenceParameters>
        </ResourceCreated></Body></E>"#;
        assert_eq!(extract_shell_id(via_selector).unwrap(), "9A1C-44");

        assert!(extract_shell_id("<E><Body/></E>").is_err());
    }

    #[test]
    fn test_extract_command_id() {
        let body = "<E><Body><CommandResponse><CommandId>CMD-77</CommandId></CommandResponse></Body></E>";
        assert_eq!(extract_command_id(body).unwrap(), "CMD-77");
    }

    #[test]
    fn test_parse_receive_streams_and_state() {
        let stdout_1 = BASE64_STANDARD.encode(b"line one\r\nli");
        let stdout_2 = BASE64_STANDARD.encode(b"ne two\r\n");
        let stderr = BASE64_STANDARD.encode(b"warning\r\n");
        let body = format!(
            r#"<E><Body><ReceiveResponse>
              <Stream Name="stdout" CommandId="C">{stdout_1}</Stream>
              <Stream Name="stderr" CommandId="C">{stderr}</Stream>
              <Stream Name="stdout" CommandId="C" End="true">{stdout_2}</Stream>
              <CommandState CommandId="C" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
                <ExitCode>0</ExitCode>
              </CommandState>
            </ReceiveResponse></Body></E>"#
        );

        let payload = parse_receive(&body).unwrap();
        assert_eq!(payload.stdout, b"line one\r\nline two\r\n");
        assert_eq!(payload.stderr, b"warning\r\n");
        assert!(payload.done);
        assert_eq!(payload.exit_code, Some(0));
    }

    #[test]
    fn test_parse_receive_running_state() {
        let body = r#"<E><Body><ReceiveResponse>
          <CommandState CommandId="C" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>
        </ReceiveResponse></Body></E>"#;
        let payload = parse_receive(body).unwrap();
        assert!(!payload.done);
        assert!(payload.stdout.is_empty());
        assert_eq!(payload.exit_code, None);
    }

    #[test]
    fn test_parse_receive_rejects_bad_base64() {
        let body = r#"<E><Body><Stream Name="stdout">!!not-base64!!</Stream></Body></E>"#;
        assert!(matches!(
            parse_receive(body),
            Err(WinRmError::MalformedResponse(_))
        ));
    }
}
