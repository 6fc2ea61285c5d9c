//! Per-connection session state machine.
//!
//! A session alternates between two regimes: a line-oriented
//! request/response loop with a 10-second idle timeout, and a blocking
//! byte-synchronous regime during XMODEM transfers in which the engine
//! owns the socket exclusively. The idle timeout belongs to the line
//! read, so a long transfer never trips it; only inactivity after the
//! transfer does.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::catalog::CommandSpec;
use crate::protocol::xmodem::{BlockMode, NoProgress, TransferOutcome, Xmodem, XmodemConfig};
use crate::stream::TcpByteStream;
use crate::vfs::normalize_path;

use super::ServerShared;

/// Idle timeout on the command line read.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum think time before answering a command.
const MIN_THINK_MS: u64 = 100;

/// Retry budget for transfers started by the session.
const TRANSFER_RETRY: u32 = 16;

/// Byte timeout while receiving an upload.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte timeout while sending a download.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) struct Session {
    stream: TcpStream,
    peer: String,
    cwd: String,
    shared: Arc<ServerShared>,
}

impl Session {
    pub(super) fn new(stream: TcpStream, peer: String, shared: Arc<ServerShared>) -> Self {
        Self {
            stream,
            peer,
            cwd: "/".to_string(),
            shared,
        }
    }

    /// Run the session until EOF, idle timeout, or a fatal I/O error.
    pub(super) fn run(mut self) -> std::io::Result<()> {
        loop {
            let Some(line) = self.read_line()? else {
                break;
            };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            info!("[{}] received command: {line}", self.peer);
            self.dispatch(&line)?;
        }
        Ok(())
    }

    /// Throw away whatever the peer still has in flight.
    ///
    /// A transfer that ends early leaves CAN bytes on the wire; they
    /// must not leak into the next command line.
    fn purge_input(&mut self) {
        if self
            .stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .is_err()
        {
            return;
        }
        let mut byte = [0u8; 1];
        while matches!(self.stream.read(&mut byte), Ok(n) if n > 0) {}
    }

    /// Read one LF-terminated line with the idle timeout.
    ///
    /// Returns `None` on EOF or timeout, both of which end the
    /// session. Reads are unbuffered on purpose: any buffering here
    /// would swallow bytes that belong to a following XMODEM transfer.
    fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.stream.set_read_timeout(Some(IDLE_TIMEOUT))?;

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    debug!("[{}] peer closed the connection", self.peer);
                    return Ok(None);
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    info!("[{}] timed out after 10 seconds of inactivity", self.peer);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    fn dispatch(&mut self, line: &str) -> std::io::Result<()> {
        let Some((key, spec, _)) = self
            .shared
            .catalog
            .resolve(line)
            .map(|(k, s, c)| (k.to_string(), s.clone(), c))
        else {
            warn!("[{}] unknown command: {line}", self.peer);
            return self.write_response("ERROR: Unknown command", false);
        };

        let arg = line[key.len().min(line.len())..].trim().to_string();

        match key.trim() {
            "upload" => self.handle_upload(&arg),
            "download" => self.handle_download(&arg),
            "time =" => {
                let reply = self.handle_time_set(&arg);
                self.respond(&reply, &spec)
            }
            "time" => {
                let reply = self.handle_time_get();
                self.respond(&reply, &spec)
            }
            "pwd" => {
                let reply = self.cwd.clone();
                self.respond(&reply, &spec)
            }
            "cd" => {
                let reply = self.handle_cd(&arg);
                self.respond(&reply, &spec)
            }
            "ls" => {
                let reply = self.handle_ls(&arg);
                self.respond(&reply, &spec)
            }
            "cat" => {
                let reply = self.handle_cat(&arg);
                self.respond(&reply, &spec)
            }
            "mv" => {
                let reply = self.handle_mv(&arg);
                self.respond(&reply, &spec)
            }
            "rm" => {
                let reply = self.handle_rm(&arg);
                self.respond(&reply, &spec)
            }
            _ => {
                self.feed_state_trackers(key.trim(), &spec.response);
                let response = spec.response.clone();
                self.respond(&response, &spec)
            }
        }
    }

    /// Keep the tracked mill record in step with what we just claimed.
    fn feed_state_trackers(&mut self, key: &str, response: &str) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        match key {
            "?" => {
                state.cnc.parse_status_line(response);
            }
            "diagnose" => {
                state.cnc.parse_diagnose_line(response);
            }
            "$G" | "$I" => {
                state.cnc.parse_modal_line(response);
            }
            _ => {}
        }
    }

    /// Canned-response path: think, answer, optionally `ok`.
    fn respond(&mut self, response: &str, spec: &CommandSpec) -> std::io::Result<()> {
        let think = spec.time_ms.max(MIN_THINK_MS);
        thread::sleep(Duration::from_millis(think));
        self.write_response(response, spec.sends_ok)
    }

    fn write_response(&mut self, response: &str, sends_ok: bool) -> std::io::Result<()> {
        self.stream.write_all(response.as_bytes())?;
        self.stream.write_all(b"\n")?;
        if sends_ok {
            self.stream.write_all(b"ok\n")?;
        }
        self.stream.flush()?;
        info!("[{}] sent response: {response}", self.peer);
        Ok(())
    }

    fn handle_time_set(&mut self, arg: &str) -> String {
        let Ok(mut state) = self.shared.state.lock() else {
            return "ERROR: Invalid time value".to_string();
        };
        match arg.parse::<f64>() {
            Ok(epoch) => {
                if state.cnc.set_time(epoch) {
                    String::new()
                } else {
                    "ERROR: Invalid time value".to_string()
                }
            }
            Err(_) => "ERROR: Invalid time value".to_string(),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // epoch range-checked at set_time
    fn handle_time_get(&mut self) -> String {
        let Ok(state) = self.shared.state.lock() else {
            return "ERROR: Time not initialized".to_string();
        };
        match state.cnc.current_time() {
            Some(epoch) => format!("{}", epoch as i64),
            None => "ERROR: Time not initialized".to_string(),
        }
    }

    fn handle_cd(&mut self, arg: &str) -> String {
        if arg.is_empty() {
            self.cwd = "/".to_string();
        } else {
            self.cwd = normalize_path(&self.cwd, arg);
        }
        String::new()
    }

    fn handle_ls(&mut self, arg: &str) -> String {
        let mut with_sizes = false;
        let mut target = self.cwd.clone();
        for token in arg.split_whitespace() {
            if token == "-s" {
                with_sizes = true;
            } else {
                target = normalize_path(&self.cwd, token);
            }
        }

        let Ok(state) = self.shared.state.lock() else {
            return String::new();
        };
        let entries = state.store.list_dir(&target);
        let lines: Vec<String> = entries
            .iter()
            .map(|e| match (with_sizes, e.size) {
                (true, Some(size)) => format!("{} {size}", e.name),
                _ => e.name.clone(),
            })
            .collect();
        lines.join("\n")
    }

    fn handle_cat(&mut self, arg: &str) -> String {
        let mut tokens = arg.split_whitespace();
        let Some(path) = tokens.next() else {
            return "ERROR: cat requires a file path".to_string();
        };
        let limit: Option<usize> = tokens.next().and_then(|t| t.parse().ok());

        let path = normalize_path(&self.cwd, path);
        let Ok(state) = self.shared.state.lock() else {
            return format!("ERROR: File not found: {path}");
        };
        let Some(file) = state.store.read(&path) else {
            return format!("ERROR: File not found: {path}");
        };

        let text = String::from_utf8_lossy(&file.contents);
        match limit {
            Some(n) => text.lines().take(n).collect::<Vec<_>>().join("\n"),
            None => text.trim_end_matches('\n').to_string(),
        }
    }

    fn handle_mv(&mut self, arg: &str) -> String {
        let tokens: Vec<&str> = arg.split_whitespace().collect();
        let [src, dst] = tokens.as_slice() else {
            return "ERROR: mv requires a source and a destination".to_string();
        };
        let src = normalize_path(&self.cwd, src);
        let dst = normalize_path(&self.cwd, dst);

        let Ok(mut state) = self.shared.state.lock() else {
            return format!("ERROR: File not found: {src}");
        };
        match state.store.rename(&src, &dst) {
            Ok(()) => String::new(),
            Err(_) => format!("ERROR: File not found: {src}"),
        }
    }

    fn handle_rm(&mut self, arg: &str) -> String {
        if arg.is_empty() {
            return "ERROR: rm requires a file path".to_string();
        }
        let path = normalize_path(&self.cwd, arg);
        let Ok(mut state) = self.shared.state.lock() else {
            return format!("ERROR: File not found: {path}");
        };
        match state.store.delete(&path) {
            Ok(()) => String::new(),
            Err(_) => format!("ERROR: File not found: {path}"),
        }
    }

    /// `upload <path>`: hand the socket to the engine in receive mode.
    fn handle_upload(&mut self, arg: &str) -> std::io::Result<()> {
        if arg.is_empty() {
            return self.write_response("ERROR: Upload requires a file path", false);
        }
        let path = normalize_path(&self.cwd, arg);

        // MD5 of any existing copy lets the engine short-circuit when
        // the client is about to re-send identical contents.
        let expected_md5 = {
            let Ok(state) = self.shared.state.lock() else {
                return self.write_response("ERROR: Upload failed", false);
            };
            state
                .store
                .read(&path)
                .map(|f| f.md5.clone())
                .unwrap_or_default()
        };

        info!("[{}] entering XMODEM receive for {path}", self.peer);
        let cancel = self.shared.transfer_cancel.clone();
        let mut sink: Vec<u8> = Vec::new();
        let outcome = {
            let mut adapter = TcpByteStream::new(&mut self.stream);
            let config = XmodemConfig {
                mode: BlockMode::Extended8k,
                retry: TRANSFER_RETRY,
                timeout: RECEIVE_TIMEOUT,
                ..XmodemConfig::default()
            };
            let mut engine = Xmodem::with_config(&mut adapter, config).with_cancel(cancel);
            engine.receive(&mut sink, &expected_md5, true, &mut NoProgress)
        };

        match outcome {
            TransferOutcome::Complete(received) => {
                let Ok(mut state) = self.shared.state.lock() else {
                    return self.write_response("ERROR: Upload failed", false);
                };
                let stored = state.store.store_upload(&path, sink);
                info!(
                    "[{}] upload complete: {stored} ({received} bytes)",
                    self.peer
                );
                Ok(())
            }
            TransferOutcome::Md5Match => self.write_response(
                "Upload canceled - file already exists with same content",
                false,
            ),
            TransferOutcome::Canceled => {
                self.purge_input();
                self.write_response("ERROR: Upload canceled", false)
            }
            TransferOutcome::Failed => {
                self.purge_input();
                self.write_response("ERROR: Upload failed", false)
            }
        }
    }

    /// `download <path>`: hand the socket to the engine in send mode.
    fn handle_download(&mut self, arg: &str) -> std::io::Result<()> {
        if arg.is_empty() {
            return self.write_response("ERROR: Download requires a file path", false);
        }
        let path = normalize_path(&self.cwd, arg);

        let file = {
            let Ok(state) = self.shared.state.lock() else {
                return self.write_response("ERROR: Download failed", false);
            };
            state.store.read(&path).cloned()
        };
        let Some(file) = file else {
            // Stay in the line regime: a missing file never starts a transfer.
            return self.write_response(&format!("ERROR: File not found: {path}"), false);
        };

        info!(
            "[{}] entering XMODEM send for {path} ({} bytes)",
            self.peer, file.size
        );
        let cancel = self.shared.transfer_cancel.clone();
        let outcome = {
            let mut adapter = TcpByteStream::new(&mut self.stream);
            let config = XmodemConfig {
                mode: BlockMode::Extended8k,
                retry: TRANSFER_RETRY,
                timeout: SEND_TIMEOUT,
                ..XmodemConfig::default()
            };
            let mut engine = Xmodem::with_config(&mut adapter, config).with_cancel(cancel);
            let mut contents = std::io::Cursor::new(file.contents);
            engine.send(&mut contents, &file.md5, &mut NoProgress)
        };

        match outcome {
            TransferOutcome::Complete(sent) => {
                info!("[{}] download complete: {path} ({sent} bytes)", self.peer);
                self.write_response("", false)
            }
            TransferOutcome::Md5Match => {
                info!("[{}] download skipped: client copy current", self.peer);
                self.purge_input();
                self.write_response("", false)
            }
            TransferOutcome::Canceled => {
                self.purge_input();
                self.write_response("ERROR: Download canceled", false)
            }
            TransferOutcome::Failed => {
                self.purge_input();
                self.write_response("ERROR: Download failed", false)
            }
        }
    }
}
