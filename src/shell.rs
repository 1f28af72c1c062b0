//! Remote command execution over the Windows Remote Shell protocol.
//!
//! [`WinRs`] drives the shell half of WS-Management: create a `cmd`
//! shell, start a command in it, read its output, signal it, delete the
//! shell. Two usage patterns sit on top of those operations:
//!
//! - [`WinRs::run_command`] / [`WinRs::run_powershell`] run one command
//!   to completion and hand back the collected output.
//! - [`WinRs::start`] leaves a command running and returns a
//!   [`LongRunningCommand`] handle; repeated [`WinRs::receive`] calls
//!   then drain its stdout as complete lines. This is how counter
//!   collectors keep a `typeperf` process streaming for hours.
//!
//! A server reboot or idle-timeout invalidates shells on the server
//! side. `receive` recognizes the fault signature and rebuilds the shell
//! and command once before giving up, so a collector survives the common
//! case without losing its handle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionInfo;
use crate::error::{WinRmError, WinRmResult};
use crate::parser::extract::{
    extract_command_id, extract_shell_id, parse_receive, ReceivePayload,
    FAULT_CODE_OPERATION_TIMEOUT,
};
use crate::registry::HostRegistry;
use crate::soap::{powershell_command, EnvelopeFactory, SignalCode};
use crate::transport::{HttpSender, WsmanSender};

// ============================================================================
// Results
// ============================================================================

/// Outcome of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Exit code reported by the remote process
    pub exit_code: i32,
    /// Collected standard output
    pub stdout: String,
    /// Collected standard error
    pub stderr: String,
    /// Whether the exit code was zero
    pub success: bool,
}

impl CommandResponse {
    pub fn new(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: exit_code == 0,
        }
    }
}

/// Handle to a command left running in a remote shell.
///
/// Holds the shell and command ids plus the tail of the output stream:
/// receives hand back complete lines only, and a trailing partial line
/// stays buffered here until its terminator arrives.
#[derive(Debug)]
pub struct LongRunningCommand {
    shell_id: String,
    command_id: String,
    command_line: String,
    pending: Vec<u8>,
}

impl LongRunningCommand {
    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Command line the process was started with. Reused when an
    /// invalidated shell forces a restart.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Append raw stdout bytes and split off the complete lines. Bytes
    /// after the last newline stay buffered, so a multi-byte character
    /// split across two receives is never decoded in halves.
    fn take_lines(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        match self.pending.iter().rposition(|b| *b == b'\n') {
            None => Vec::new(),
            Some(last) => {
                let complete: Vec<u8> = self.pending.drain(..=last).collect();
                String::from_utf8_lossy(&complete)
                    .lines()
                    .map(str::to_string)
                    .collect()
            }
        }
    }
}

// ============================================================================
// Shell Client
// ============================================================================

/// Shell client for one host.
pub struct WinRs {
    sender: Arc<dyn WsmanSender>,
    factory: EnvelopeFactory,
    host: String,
}

impl WinRs {
    /// Create a shell client over an existing sender.
    pub fn new(sender: Arc<dyn WsmanSender>, info: &ConnectionInfo) -> Self {
        Self {
            sender,
            factory: EnvelopeFactory::new(info),
            host: info.hostname().to_string(),
        }
    }

    /// Create a shell client with its own HTTP transport.
    pub fn connect(info: ConnectionInfo, registry: Arc<HostRegistry>) -> WinRmResult<Self> {
        let sender = Arc::new(HttpSender::new(info.clone(), registry)?);
        Ok(Self::new(sender, &info))
    }

    /// Host this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    // ------------------------------------------------------------------
    // Protocol operations
    // ------------------------------------------------------------------

    /// Create a remote `cmd` shell and return its id.
    pub async fn create_shell(&self) -> WinRmResult<String> {
        let envelope = self.factory.create_shell(Uuid::new_v4());
        let reply = self.sender.send(&envelope).await?;
        let shell_id = extract_shell_id(&reply.body_string())?;
        debug!(host = %self.host, shell_id = %shell_id, "Shell created");
        Ok(shell_id)
    }

    /// Start a command in an existing shell and return the command id.
    pub async fn start_command(&self, shell_id: &str, command: &str) -> WinRmResult<String> {
        let envelope = self
            .factory
            .command(Uuid::new_v4(), shell_id, command, &[])?;
        let reply = self.sender.send(&envelope).await?;
        let command_id = extract_command_id(&reply.body_string())?;
        debug!(
            host = %self.host,
            shell_id = %shell_id,
            command_id = %command_id,
            command = %command,
            "Command started"
        );
        Ok(command_id)
    }

    /// Send a control signal to a command.
    pub async fn signal(
        &self,
        shell_id: &str,
        command_id: &str,
        code: SignalCode,
    ) -> WinRmResult<()> {
        let envelope = self
            .factory
            .signal(Uuid::new_v4(), shell_id, command_id, code);
        self.sender.send(&envelope).await?;
        Ok(())
    }

    /// Delete a shell, releasing its server-side resources.
    pub async fn delete_shell(&self, shell_id: &str) -> WinRmResult<()> {
        let envelope = self.factory.delete_shell(Uuid::new_v4(), shell_id);
        self.sender.send(&envelope).await?;
        debug!(host = %self.host, shell_id = %shell_id, "Shell deleted");
        Ok(())
    }

    /// One Receive round trip. A fault telling us the receive window
    /// expired with nothing to deliver comes back as an empty payload,
    /// not an error.
    async fn receive_raw(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> WinRmResult<ReceivePayload> {
        let envelope = self.factory.receive(Uuid::new_v4(), shell_id, command_id);
        match self.sender.send(&envelope).await {
            Ok(reply) => parse_receive(&reply.body_string()),
            Err(WinRmError::RequestError {
                code: Some(FAULT_CODE_OPERATION_TIMEOUT),
                ..
            }) => {
                trace!(
                    host = %self.host,
                    command_id = %command_id,
                    "Receive window expired with no output"
                );
                Ok(ReceivePayload::default())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Single-shot execution
    // ------------------------------------------------------------------

    /// Run one command to completion in a fresh shell.
    pub async fn run_command(&self, command: &str) -> WinRmResult<CommandResponse> {
        let shell_id = self.create_shell().await?;
        let result = self.run_in_shell(&shell_id, command).await;
        if let Err(e) = self.delete_shell(&shell_id).await {
            debug!(host = %self.host, shell_id = %shell_id, error = %e, "Shell cleanup failed");
        }
        result
    }

    /// Run a PowerShell script to completion, wrapped for non-interactive
    /// plain-text output.
    pub async fn run_powershell(&self, script: &str) -> WinRmResult<CommandResponse> {
        self.run_command(&powershell_command(script)).await
    }

    async fn run_in_shell(&self, shell_id: &str, command: &str) -> WinRmResult<CommandResponse> {
        let command_id = self.start_command(shell_id, command).await?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let exit_code = loop {
            let payload = self.receive_raw(shell_id, &command_id).await?;
            stdout.extend_from_slice(&payload.stdout);
            stderr.extend_from_slice(&payload.stderr);
            if payload.done {
                break payload.exit_code.unwrap_or(-1);
            }
        };

        // Release the command slot; completion already happened.
        if let Err(e) = self
            .signal(shell_id, &command_id, SignalCode::Terminate)
            .await
        {
            debug!(host = %self.host, command_id = %command_id, error = %e, "Terminate signal failed");
        }

        debug!(
            host = %self.host,
            command_id = %command_id,
            exit_code,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Command completed"
        );
        Ok(CommandResponse::new(
            exit_code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    // ------------------------------------------------------------------
    // Long-running execution
    // ------------------------------------------------------------------

    /// Start a command and leave it running. The shell is cleaned up if
    /// the command itself fails to start.
    pub async fn start(&self, command_line: &str) -> WinRmResult<LongRunningCommand> {
        let shell_id = self.create_shell().await?;
        match self.start_command(&shell_id, command_line).await {
            Ok(command_id) => Ok(LongRunningCommand {
                shell_id,
                command_id,
                command_line: command_line.to_string(),
                pending: Vec::new(),
            }),
            Err(e) => {
                if let Err(cleanup) = self.delete_shell(&shell_id).await {
                    debug!(host = %self.host, shell_id = %shell_id, error = %cleanup, "Shell cleanup failed");
                }
                Err(e)
            }
        }
    }

    /// Drain pending stdout from a long-running command as complete
    /// lines. An empty vector means the command produced no complete
    /// line since the last call.
    ///
    /// When the server reports the shell gone, the shell and command are
    /// recreated once and the receive retried; the handle is updated in
    /// place. A second invalidation in the same call is returned to the
    /// caller.
    pub async fn receive(&self, command: &mut LongRunningCommand) -> WinRmResult<Vec<String>> {
        let payload = match self
            .receive_raw(&command.shell_id, &command.command_id)
            .await
        {
            Ok(payload) => payload,
            Err(e) if e.is_shell_invalidated() => {
                warn!(
                    host = %self.host,
                    shell_id = %command.shell_id,
                    error = %e,
                    "Shell invalidated; recreating shell and command"
                );
                self.restart(command).await?;
                self.receive_raw(&command.shell_id, &command.command_id)
                    .await?
            }
            Err(e) => return Err(e),
        };

        if !payload.stderr.is_empty() {
            warn!(
                host = %self.host,
                command_id = %command.command_id,
                stderr = %String::from_utf8_lossy(&payload.stderr),
                "Remote command wrote to stderr"
            );
        }
        if payload.done {
            debug!(
                host = %self.host,
                command_id = %command.command_id,
                exit_code = ?payload.exit_code,
                "Long-running command reached Done state"
            );
        }
        Ok(command.take_lines(&payload.stdout))
    }

    /// Write bytes to a long-running command's stdin.
    pub async fn send_input(
        &self,
        command: &LongRunningCommand,
        data: &[u8],
        end: bool,
    ) -> WinRmResult<()> {
        let envelope = self.factory.send_input(
            Uuid::new_v4(),
            &command.shell_id,
            &command.command_id,
            data,
            end,
        );
        self.sender.send(&envelope).await?;
        Ok(())
    }

    /// Terminate a long-running command and delete its shell.
    ///
    /// Never fails: cleanup runs on paths where the shell may already be
    /// gone, and a missing shell is the desired end state. Failures that
    /// look like an already-dead shell are logged at debug, anything
    /// else at warn.
    pub async fn stop(&self, command: &LongRunningCommand) {
        let signal = self.factory.signal(
            Uuid::new_v4(),
            &command.shell_id,
            &command.command_id,
            SignalCode::Terminate,
        );
        if let Err(e) = self.sender.send(&signal).await {
            self.log_stop_failure("signal", &command.shell_id, &e);
        }

        let delete = self.factory.delete_shell(Uuid::new_v4(), &command.shell_id);
        match self.sender.send(&delete).await {
            Ok(_) => debug!(host = %self.host, shell_id = %command.shell_id, "Shell deleted"),
            Err(e) => self.log_stop_failure("delete", &command.shell_id, &e),
        }
    }

    async fn restart(&self, command: &mut LongRunningCommand) -> WinRmResult<()> {
        let shell_id = self.create_shell().await?;
        match self.start_command(&shell_id, &command.command_line).await {
            Ok(command_id) => {
                command.shell_id = shell_id;
                command.command_id = command_id;
                // Output buffered from the dead incarnation is stale.
                command.pending.clear();
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_shell(&shell_id).await {
                    debug!(host = %self.host, shell_id = %shell_id, error = %cleanup, "Shell cleanup failed");
                }
                Err(e)
            }
        }
    }

    fn log_stop_failure(&self, operation: &str, shell_id: &str, error: &WinRmError) {
        if stop_failure_is_benign(error) {
            debug!(
                host = %self.host,
                shell_id = %shell_id,
                operation,
                error = %error,
                "Shell already gone during stop"
            );
        } else {
            warn!(
                host = %self.host,
                shell_id = %shell_id,
                operation,
                error = %error,
                "Stop cleanup failed"
            );
        }
    }
}

/// Stop cleanup failures that mean the shell or command is already gone.
fn stop_failure_is_benign(error: &WinRmError) -> bool {
    match error {
        WinRmError::ShellInvalidated(_) => true,
        WinRmError::RequestError { reason, .. } => {
            let reason = reason.to_ascii_lowercase();
            reason.contains("terminat") || reason.contains("not found")
        }
        _ => false,
    }
}
