//! SOAP envelope construction for WS-Management requests.
//!
//! Every operation the crate performs on the wire starts here: the
//! [`EnvelopeFactory`] renders complete `s:Envelope` documents for the
//! enumeration, shell, and identify operations. Envelopes are pure
//! functions of the factory's connection parameters and the per-call
//! arguments, so handing in the same message id twice yields byte-identical
//! output. Callers mint message ids (v4 UUIDs in production, fixed values
//! in tests).

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use quick_xml::escape::escape as xml_escape;
use uuid::Uuid;

use crate::config::ConnectionInfo;
use crate::error::{WinRmError, WinRmResult};

// ============================================================================
// Constants
// ============================================================================

/// SOAP and WS-Management namespaces
pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub const WSMAN_MS_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub const WSEN_NS: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
pub const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
pub const WSMID_NS: &str = "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd";

/// Address placed in every `a:ReplyTo` header
const ANONYMOUS_ADDRESS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// WQL filter dialect for WMI enumerations
const WQL_DIALECT: &str = "http://schemas.microsoft.com/wbem/wsman/1/WQL";

/// Resource URI of the cmd remote shell
pub const SHELL_RESOURCE_URI: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

/// Base of WMI enumeration resource URIs
const WMI_RESOURCE_BASE: &str = "http://schemas.microsoft.com/wbem/wsman/1/wmi";

/// WS-Management action URIs
pub const ACTION_ENUMERATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate";
pub const ACTION_PULL: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Pull";
pub const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
pub const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
pub const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
pub const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
pub const ACTION_SIGNAL: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
pub const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
pub const ACTION_IDENTIFY: &str =
    "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity/Identify";

/// Build the WMI enumeration resource URI for a namespace such as
/// `root\cimv2` or `root/standardcimv2`.
pub fn wmi_resource_uri(namespace: &str) -> String {
    format!(
        "{}/{}/*",
        WMI_RESOURCE_BASE,
        namespace.replace('\\', "/")
    )
}

/// Signal codes understood by the remote shell service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCode {
    /// Terminate the command
    Terminate,
    /// Interrupt the command (Ctrl+C)
    CtrlC,
}

impl SignalCode {
    pub fn as_uri(&self) -> &'static str {
        match self {
            SignalCode::Terminate => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate"
            }
            SignalCode::CtrlC => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/ctrl_c"
            }
        }
    }
}

/// Wrap a script into a non-interactive PowerShell invocation with plain
/// text output. Inner double quotes are backslash-escaped so the script
/// survives the Windows command line.
pub fn powershell_command(script: &str) -> String {
    let escaped = script.replace('"', "\\\"");
    format!(
        "powershell -NoLogo -NonInteractive -NoProfile -OutputFormat TEXT -Command \"& {{{}}}\"",
        escaped
    )
}

// ============================================================================
// Envelope Factory
// ============================================================================

/// Renders SOAP envelopes for one connection target.
///
/// Snapshots the connection parameters that go into every header (endpoint
/// address, envelope size, operation timeout, locale) so envelope output
/// depends only on the factory and the per-call arguments.
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    endpoint: String,
    max_envelope_size: u32,
    operation_timeout: String,
    locale: String,
    codepage: u32,
}

impl EnvelopeFactory {
    /// Create a factory for the given connection.
    pub fn new(info: &ConnectionInfo) -> Self {
        Self {
            endpoint: info.endpoint_url(),
            max_envelope_size: info.max_envelope_size(),
            operation_timeout: info.operation_timeout_iso8601(),
            locale: info.locale().to_string(),
            codepage: info.codepage(),
        }
    }

    /// Common header block shared by all operations. `extra` carries
    /// operation-specific headers such as a `w:SelectorSet` or
    /// `w:OptionSet` and may be empty.
    fn header(&self, action: &str, resource_uri: &str, message_id: Uuid, extra: &str) -> String {
        format!(
            r#"<s:Header>
    <a:To>{}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{}</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{}</w:OperationTimeout>
    <w:Locale xml:lang="{}" s:mustUnderstand="false"/>
    <p:DataLocale xml:lang="{}" s:mustUnderstand="false"/>{}
  </s:Header>"#,
            self.endpoint,
            resource_uri,
            action,
            message_id,
            self.max_envelope_size,
            self.operation_timeout,
            self.locale,
            self.locale,
            extra,
        )
    }

    fn shell_selector(shell_id: &str) -> String {
        format!(
            r#"
    <w:SelectorSet>
      <w:Selector Name="ShellId">{}</w:Selector>
    </w:SelectorSet>"#,
            xml_escape(shell_id)
        )
    }

    fn envelope(&self, header: String, body: String) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:p="{WSMAN_MS_NS}" xmlns:wsen="{WSEN_NS}" xmlns:rsp="{SHELL_NS}">
  {}
  <s:Body>
    {}
  </s:Body>
</s:Envelope>"#,
            header, body,
        )
    }

    // ------------------------------------------------------------------
    // Identify
    // ------------------------------------------------------------------

    /// Identify request for connection testing. Carries no resource URI or
    /// sizing headers; servers answer it before authentication in some
    /// configurations.
    pub fn identify(&self, message_id: Uuid) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:wsmid="{WSMID_NS}">
  <s:Header>
    <a:To>{}</a:To>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{ACTION_IDENTIFY}</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
  </s:Header>
  <s:Body>
    <wsmid:Identify/>
  </s:Body>
</s:Envelope>"#,
            self.endpoint, message_id,
        )
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Enumerate request with a WQL filter. `OptimizeEnumeration` asks the
    /// server to deliver the first batch of results in the
    /// EnumerateResponse itself, saving one round trip per query.
    pub fn enumerate(
        &self,
        message_id: Uuid,
        resource_uri: &str,
        wql: &str,
        max_elements: u32,
    ) -> WinRmResult<String> {
        if resource_uri.is_empty() {
            return Err(WinRmError::InvalidParameter(
                "enumeration resource URI is empty".to_string(),
            ));
        }
        if wql.trim().is_empty() {
            return Err(WinRmError::InvalidParameter("WQL query is empty".to_string()));
        }

        let body = format!(
            r#"<wsen:Enumerate>
      <w:OptimizeEnumeration/>
      <w:MaxElements>{}</w:MaxElements>
      <w:Filter Dialect="{WQL_DIALECT}">{}</w:Filter>
    </wsen:Enumerate>"#,
            max_elements,
            xml_escape(wql),
        );
        let header = self.header(ACTION_ENUMERATE, resource_uri, message_id, "");
        Ok(self.envelope(header, body))
    }

    /// Pull request continuing an enumeration from a context token.
    pub fn pull(
        &self,
        message_id: Uuid,
        resource_uri: &str,
        context: &str,
        max_elements: u32,
    ) -> WinRmResult<String> {
        if context.is_empty() {
            return Err(WinRmError::InvalidParameter(
                "enumeration context token is empty".to_string(),
            ));
        }

        let body = format!(
            r#"<wsen:Pull>
      <wsen:EnumerationContext>{}</wsen:EnumerationContext>
      <w:MaxElements>{}</w:MaxElements>
    </wsen:Pull>"#,
            xml_escape(context),
            max_elements,
        );
        let header = self.header(ACTION_PULL, resource_uri, message_id, "");
        Ok(self.envelope(header, body))
    }

    // ------------------------------------------------------------------
    // Shell lifecycle
    // ------------------------------------------------------------------

    /// Create a cmd shell with stdin/stdout/stderr streams.
    pub fn create_shell(&self, message_id: Uuid) -> String {
        let options = format!(
            r#"
    <w:OptionSet>
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">{}</w:Option>
    </w:OptionSet>"#,
            self.codepage,
        );
        let body = r#"<rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>"#
            .to_string();
        let header = self.header(ACTION_CREATE, SHELL_RESOURCE_URI, message_id, &options);
        self.envelope(header, body)
    }

    /// Start a command in an existing shell.
    pub fn command(
        &self,
        message_id: Uuid,
        shell_id: &str,
        command: &str,
        args: &[&str],
    ) -> WinRmResult<String> {
        if command.trim().is_empty() {
            return Err(WinRmError::InvalidParameter(
                "command line is empty".to_string(),
            ));
        }

        let args_xml: String = args
            .iter()
            .map(|arg| format!("\n      <rsp:Arguments>{}</rsp:Arguments>", xml_escape(arg)))
            .collect();
        let body = format!(
            r#"<rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>{}
    </rsp:CommandLine>"#,
            xml_escape(command),
            args_xml,
        );
        let extra = Self::shell_selector(shell_id);
        let header = self.header(ACTION_COMMAND, SHELL_RESOURCE_URI, message_id, &extra);
        Ok(self.envelope(header, body))
    }

    /// Request pending stdout/stderr output from a running command.
    pub fn receive(&self, message_id: Uuid, shell_id: &str, command_id: &str) -> String {
        let body = format!(
            r#"<rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>"#,
            xml_escape(command_id),
        );
        let extra = Self::shell_selector(shell_id);
        let header = self.header(ACTION_RECEIVE, SHELL_RESOURCE_URI, message_id, &extra);
        self.envelope(header, body)
    }

    /// Write bytes to a running command's stdin. `end` marks the stream
    /// closed after this write.
    pub fn send_input(
        &self,
        message_id: Uuid,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
        end: bool,
    ) -> String {
        let end_attr = if end { r#" End="true""# } else { "" };
        let body = format!(
            r#"<rsp:Send>
      <rsp:Stream Name="stdin" CommandId="{}"{}>{}</rsp:Stream>
    </rsp:Send>"#,
            xml_escape(command_id),
            end_attr,
            BASE64_STANDARD.encode(data),
        );
        let extra = Self::shell_selector(shell_id);
        let header = self.header(ACTION_SEND, SHELL_RESOURCE_URI, message_id, &extra);
        self.envelope(header, body)
    }

    /// Send a control signal to a running command.
    pub fn signal(
        &self,
        message_id: Uuid,
        shell_id: &str,
        command_id: &str,
        code: SignalCode,
    ) -> String {
        let body = format!(
            r#"<rsp:Signal CommandId="{}">
      <rsp:Code>{}</rsp:Code>
    </rsp:Signal>"#,
            xml_escape(command_id),
            code.as_uri(),
        );
        let extra = Self::shell_selector(shell_id);
        let header = self.header(ACTION_SIGNAL, SHELL_RESOURCE_URI, message_id, &extra);
        self.envelope(header, body)
    }

    /// Delete a shell, releasing its server-side resources.
    pub fn delete_shell(&self, message_id: Uuid, shell_id: &str) -> String {
        let extra = Self::shell_selector(shell_id);
        let header = self.header(ACTION_DELETE, SHELL_RESOURCE_URI, message_id, &extra);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:p="{WSMAN_MS_NS}">
  {}
  <s:Body/>
</s:Envelope>"#,
            header,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Auth;

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
    fn test_wmi_resource_uri() {
        assert_eq!(
            wmi_resource_uri(r"root\cimv2"),
            "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/*"
        );
        assert_eq!(
            wmi_resource_uri("root/standardcimv2"),
            "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/standardcimv2/*"
        );
    }

    #[test]
    fn test_powershell_command_wrapping() {
        assert_eq!(
            powershell_command("Get-Date"),
            "powershell -NoLogo -NonInteractive -NoProfile -OutputFormat TEXT -Command \"& {Get-Date}\""
        );
        // Inner quotes survive the command line.
        assert_eq!(
            powershell_command(r#"Write-Output "hi""#),
            "powershell -NoLogo -NonInteractive -NoProfile -OutputFormat TEXT -Command \"& {Write-Output \\\"hi\\\"}\""
        );
    }

    #[test]
    fn test_enumerate_envelope_is_deterministic() {
        let factory = factory();
        let uri = wmi_resource_uri(r"root\cimv2");
        let a = factory
            .enumerate(fixed_id(), &uri, "SELECT * FROM Win32_Service", 100)
            .unwrap();
        let b = factory
            .enumerate(fixed_id(), &uri, "SELECT * FROM Win32_Service", 100)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_enumerate_envelope_contents() {
        let factory = factory();
        let uri = wmi_resource_uri(r"root\cimv2");
        let envelope = factory
            .enumerate(
                fixed_id(),
                &uri,
                "SELECT * FROM Win32_Service WHERE Name='W32Time' AND StartMode<>'Disabled'",
                50,
            )
            .unwrap();

        assert!(envelope.contains(ACTION_ENUMERATE));
        assert!(envelope.contains("<a:To>http://srv1.example.com:5985/wsman</a:To>"));
        assert!(envelope.contains("uuid:11111111-2222-3333-4444-555555555555"));
        assert!(envelope.contains("<w:OptimizeEnumeration/>"));
        assert!(envelope.contains("<w:MaxElements>50</w:MaxElements>"));
        // The WQL is escaped for XML.
        assert!(envelope.contains("Name=&apos;W32Time&apos;"));
        assert!(envelope.contains("StartMode&lt;&gt;&apos;Disabled&apos;"));
        assert!(envelope.contains("<w:OperationTimeout>PT60S</w:OperationTimeout>"));
    }

    #[test]
    fn test_enumerate_rejects_empty_query() {
        let factory = factory();
        let uri = wmi_resource_uri(r"root\cimv2");
        assert!(matches!(
            factory.enumerate(fixed_id(), &uri, "   ", 100),
            Err(WinRmError::InvalidParameter(_))
        ));
        assert!(matches!(
            factory.enumerate(fixed_id(), "", "SELECT * FROM X", 100),
            Err(WinRmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_pull_envelope_carries_context() {
        let factory = factory();
        let uri = wmi_resource_uri(r"root\cimv2");
        let envelope = factory
            .pull(fixed_id(), &uri, "uuid:ctx-123", 100)
            .unwrap();
        assert!(envelope.contains(ACTION_PULL));
        assert!(envelope.contains("<wsen:EnumerationContext>uuid:ctx-123</wsen:EnumerationContext>"));

        assert!(matches!(
            factory.pull(fixed_id(), &uri, "", 100),
            Err(WinRmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_create_shell_envelope() {
        let envelope = factory().create_shell(fixed_id());
        assert!(envelope.contains(ACTION_CREATE));
        assert!(envelope.contains(SHELL_RESOURCE_URI));
        assert!(envelope.contains(r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#));
        assert!(envelope.contains("<rsp:InputStreams>stdin</rsp:InputStreams>"));
        assert!(envelope.contains("<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>"));
    }

    #[test]
    fn test_command_envelope_escapes_and_selects_shell() {
        let envelope = factory()
            .command(
                fixed_id(),
                "SHELL-1",
                r#"typeperf -si 10 "\Memory\Pages/sec""#,
                &[],
            )
            .unwrap();
        assert!(envelope.contains(ACTION_COMMAND));
        assert!(envelope.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
        assert!(envelope.contains("typeperf -si 10 &quot;\\Memory\\Pages/sec&quot;"));

        assert!(matches!(
            factory().command(fixed_id(), "SHELL-1", "", &[]),
            Err(WinRmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_receive_envelope_targets_command() {
        let envelope = factory().receive(fixed_id(), "SHELL-1", "CMD-9");
        assert!(envelope.contains(ACTION_RECEIVE));
        assert!(envelope.contains(r#"<rsp:DesiredStream CommandId="CMD-9">stdout stderr</rsp:DesiredStream>"#));
    }

    #[test]
    fn test_send_input_encodes_base64() {
        let envelope = factory().send_input(fixed_id(), "SHELL-1", "CMD-9", b"dir\r\n", true);
        assert!(envelope.contains(ACTION_SEND));
        assert!(envelope.contains(r#"End="true""#));
        assert!(envelope.contains(&BASE64_STANDARD.encode(b"dir\r\n")));

        let open = factory().send_input(fixed_id(), "SHELL-1", "CMD-9", b"x", false);
        assert!(!open.contains("End="));
    }

    #[test]
    fn test_signal_and_delete_envelopes() {
        let signal = factory().signal(fixed_id(), "SHELL-1", "CMD-9", SignalCode::Terminate);
        assert!(signal.contains(ACTION_SIGNAL));
        assert!(signal.contains("signal/terminate"));

        let delete = factory().delete_shell(fixed_id(), "SHELL-1");
        assert!(delete.contains(ACTION_DELETE));
        assert!(delete.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
        assert!(delete.contains("<s:Body/>"));
    }

    #[test]
    fn test_identify_envelope() {
        let envelope = factory().identify(fixed_id());
        assert!(envelope.contains(ACTION_IDENTIFY));
        assert!(envelope.contains("<wsmid:Identify/>"));
    }
}
