//! XMODEM file transfer engine.
//!
//! Implements the mill's XMODEM dialect: classic 128-byte blocks plus
//! the 8192-byte "8K" extension, with an MD5 digest carried in the
//! sequence-0 block so a receiver that already holds the file can skip
//! the transfer. The framing and retry behavior reproduce the
//! controller firmware byte for byte, which is what makes the mock
//! controller interchangeable with a real machine.
//!
//! ## Block format
//!
//! ```text
//! +---------+-----+------+--------------+-------------------+-----------+
//! | SOH/STX | SEQ | ~SEQ | LEN (1 or 2) | DATA (128 / 8192) | CRC / SUM |
//! +---------+-----+------+--------------+-------------------+-----------+
//! ```
//!
//! `SOH` introduces 128-byte payloads with a one-byte length prefix;
//! `STX` introduces 8K payloads with a two-byte big-endian prefix.
//! Payloads are right-padded with 0x1A. The CRC16 (or one-byte sum) is
//! computed over the length prefix and the padded payload, never over
//! the three header bytes.
//!
//! The engine is deliberately synchronous: it runs as straight-line
//! code over a [`ByteStream`] and owns the wire for the whole transfer.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, info, warn};
use md5::{Digest, Md5};

use crate::protocol::crc::{checksum8, crc16_xmodem};
use crate::stream::ByteStream;
use crate::CancelFlag;

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (8192-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel. The mill firmware uses 0x16, not the classic 0x18.
    pub const CAN: u8 = 0x16;
    /// CRC mode request character.
    pub const CRC: u8 = b'C';
}

/// Padding byte for short payloads.
pub const PAD: u8 = 0x1A;

/// Length of the MD5 hex digest carried in the sequence-0 block.
pub const MD5_LEN: usize = 32;

/// Abort timeout used when the engine gives up mid-stream.
const ABORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the header re-read after a silent gap.
const HEADER_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Block size negotiated by the first data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// 128-byte payloads, announced with `SOH`.
    Standard,
    /// 8192-byte payloads, announced with `STX`.
    Extended8k,
}

impl BlockMode {
    /// Payload size in bytes.
    pub fn packet_size(self) -> usize {
        match self {
            Self::Standard => 128,
            Self::Extended8k => 8192,
        }
    }

    /// Header byte announcing this mode.
    pub fn header_byte(self) -> u8 {
        match self {
            Self::Standard => control::SOH,
            Self::Extended8k => control::STX,
        }
    }

    /// Width of the length prefix (1 for 128-byte, 2 for 8K blocks).
    pub fn prefix_len(self) -> usize {
        if self.packet_size() > 255 { 2 } else { 1 }
    }
}

/// XMODEM configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Block size mode. A receiver overwrites this from the first
    /// header unless the mode has been pinned.
    pub mode: BlockMode,
    /// Padding byte for short payloads.
    pub pad: u8,
    /// Retry budget for handshakes and individual blocks.
    pub retry: u32,
    /// Timeout for a single byte-level operation.
    pub timeout: Duration,
    /// Pause after a failed handshake probe write.
    pub delay: Duration,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            mode: BlockMode::Extended8k,
            pad: PAD,
            retry: 16,
            timeout: Duration::from_secs(5),
            delay: Duration::from_millis(100),
        }
    }
}

/// Result of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Transfer finished; carries the number of useful payload bytes
    /// moved (the MD5 block does not count).
    Complete(u64),
    /// The receiver already holds an identical file; nothing was
    /// written and the transfer was cut short with CAN bytes.
    Md5Match,
    /// Canceled, either by the peer (two consecutive CANs) or through
    /// the local cancellation flag.
    Canceled,
    /// Retry budget exhausted or the peer behaved unrecoverably.
    Failed,
}

/// Progress observer for long transfers.
pub trait Progress {
    /// Called after every acknowledged block and every counted error.
    fn on_progress(&mut self, bytes_transferred: u64, blocks: u32, errors: u32);
}

/// Progress observer that ignores everything.
pub struct NoProgress;

impl Progress for NoProgress {
    fn on_progress(&mut self, _bytes: u64, _blocks: u32, _errors: u32) {}
}

/// Compute the lowercase hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// XMODEM transfer handler.
pub struct Xmodem<'a, S: ByteStream> {
    port: &'a mut S,
    config: XmodemConfig,
    mode_set: bool,
    cancel: CancelFlag,
}

impl<'a, S: ByteStream> Xmodem<'a, S> {
    /// Create a transfer handler with default configuration.
    pub fn new(port: &'a mut S) -> Self {
        Self::with_config(port, XmodemConfig::default())
    }

    /// Create a transfer handler with custom configuration.
    pub fn with_config(port: &'a mut S, config: XmodemConfig) -> Self {
        Self {
            port,
            config,
            mode_set: false,
            cancel: CancelFlag::default(),
        }
    }

    /// Attach a cancellation flag, checked at block boundaries.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Allow the next receive to pick its block mode from the wire again.
    pub fn clear_mode_set(&mut self) {
        self.mode_set = false;
    }

    /// Block mode currently in effect.
    pub fn mode(&self) -> BlockMode {
        self.config.mode
    }

    fn get1(&mut self, timeout: Duration) -> Option<u8> {
        self.port.get(1, timeout).map(|b| b[0])
    }

    fn put1(&mut self, byte: u8, timeout: Duration) -> Option<usize> {
        self.port.put(&[byte], timeout)
    }

    /// Read until the line goes quiet.
    fn drain_input(&mut self, timeout: Duration) {
        while self.get1(timeout).is_some() {}
    }

    /// Send an abort sequence of `count` CAN bytes.
    pub fn abort(&mut self, count: usize, timeout: Duration) {
        for _ in 0..count {
            let _ = self.put1(control::CAN, timeout);
        }
    }

    /// Emit the CAN triple for a locally requested cancellation, drain
    /// whatever the peer still has in flight, and reset the flag.
    fn cancel_transfer(&mut self, timeout: Duration) {
        warn!("cancellation requested, sending CAN sequence");
        let _ = self.put1(control::CAN, timeout);
        let _ = self.put1(control::CAN, timeout);
        let _ = self.put1(control::CAN, timeout);
        self.drain_input(timeout);
        self.cancel.clear();
    }

    fn make_header(mode: BlockMode, sequence: u8) -> [u8; 3] {
        [mode.header_byte(), sequence, 0xFF - sequence]
    }

    /// Frame a payload: length prefix, data, padding to the nominal size.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // data.len() <= packet_size
    fn frame_payload(mode: BlockMode, pad: u8, data: &[u8]) -> Vec<u8> {
        let packet_size = mode.packet_size();
        let prefix = mode.prefix_len();
        debug_assert!(data.len() <= packet_size);

        let mut framed = Vec::with_capacity(prefix + packet_size);
        if prefix == 1 {
            framed.push(data.len() as u8);
        } else {
            framed.write_u16::<BigEndian>(data.len() as u16).unwrap();
        }
        framed.extend_from_slice(data);
        framed.resize(prefix + packet_size, pad);
        framed
    }

    /// Checksum tail over a framed payload (prefix included).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn make_checksum(crc_mode: bool, framed: &[u8]) -> Vec<u8> {
        let mut tail = Vec::with_capacity(2);
        if crc_mode {
            tail.write_u16::<BigEndian>(crc16_xmodem(framed)).unwrap();
        } else {
            tail.push(checksum8(framed));
        }
        tail
    }

    /// Strip and verify the checksum tail of a received packet.
    fn verify_checksum(crc_mode: bool, data: &[u8]) -> Option<&[u8]> {
        if crc_mode {
            let (payload, tail) = data.split_at(data.len() - 2);
            let theirs = (u16::from(tail[0]) << 8) | u16::from(tail[1]);
            let ours = crc16_xmodem(payload);
            if theirs == ours {
                Some(payload)
            } else {
                debug!("CRC mismatch: theirs={theirs:#06x} ours={ours:#06x}");
                None
            }
        } else {
            let (payload, tail) = data.split_at(data.len() - 1);
            let ours = checksum8(payload);
            if tail[0] == ours {
                Some(payload)
            } else {
                debug!("checksum mismatch: theirs={:#04x} ours={ours:#04x}", tail[0]);
                None
            }
        }
    }

    /// Send a file (the controller side of a `download`).
    ///
    /// Waits for the receiver's handshake byte (`C` for CRC16, NAK for
    /// the one-byte sum), then transmits the MD5 digest as sequence 0
    /// followed by the data blocks and EOT. `md5` must be the 32-char
    /// hex digest of the whole stream.
    pub fn send(
        &mut self,
        stream: &mut impl Read,
        md5: &str,
        progress: &mut impl Progress,
    ) -> TransferOutcome {
        let mode = self.config.mode;
        let packet_size = mode.packet_size();
        let pad = self.config.pad;
        let retry = self.config.retry;
        let timeout = self.config.timeout;

        info!("XMODEM send: mode={mode:?}, md5={md5}");

        // Handshake: wait for the receiver to pick a checksum flavor.
        let mut error_count: u32 = 0;
        let mut crc_mode = false;
        let mut cancel_pending = false;
        loop {
            match self.get1(timeout) {
                Some(control::NAK) => {
                    info!("handshake complete: simple checksum mode");
                    crc_mode = false;
                    break;
                }
                Some(control::CRC) => {
                    info!("handshake complete: CRC16 mode");
                    crc_mode = true;
                    break;
                }
                Some(control::CAN) => {
                    if cancel_pending {
                        warn!("transmission canceled: 2xCAN at start sequence");
                        return TransferOutcome::Canceled;
                    }
                    debug!("first CAN at start sequence");
                    cancel_pending = true;
                }
                Some(control::EOT) => {
                    warn!("transmission canceled: EOT at start sequence");
                    return TransferOutcome::Failed;
                }
                Some(byte) => debug!("unexpected handshake byte {byte:#04x}"),
                None => debug!("handshake timeout"),
            }
            error_count += 1;
            if error_count > retry {
                warn!("handshake failed after {retry} errors, aborting");
                self.abort(2, timeout);
                return TransferOutcome::Failed;
            }
        }

        // Data phase. Sequence 0 always carries the digest.
        let mut error_count: u32 = 0;
        let mut success_count: u32 = 0;
        let mut sequence: u8 = 0;
        let mut md5_sent = false;
        let mut bytes_sent: u64 = 0;

        loop {
            if self.cancel.is_canceled() {
                self.cancel_transfer(timeout);
                return TransferOutcome::Canceled;
            }

            let (data, is_data_block) = if !md5_sent && sequence == 0 {
                md5_sent = true;
                debug!("preparing MD5 block");
                (md5.as_bytes().to_vec(), false)
            } else {
                match read_chunk(stream, packet_size) {
                    Ok(chunk) => (chunk, true),
                    Err(e) => {
                        warn!("input stream error: {e}, aborting");
                        self.abort(2, timeout);
                        return TransferOutcome::Failed;
                    }
                }
            };

            if data.is_empty() {
                debug!("end of stream, sending EOT");
                break;
            }

            let header = Self::make_header(mode, sequence);
            let framed = Self::frame_payload(mode, pad, &data);
            let checksum = Self::make_checksum(crc_mode, &framed);

            let mut packet = Vec::with_capacity(3 + framed.len() + checksum.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&framed);
            packet.extend_from_slice(&checksum);

            // Per-block retry loop.
            loop {
                debug!("sending block {sequence} ({} bytes)", packet.len());
                let _ = self.port.put(&packet, timeout);

                match self.get1(timeout) {
                    Some(control::ACK) => {
                        success_count += 1;
                        if is_data_block {
                            bytes_sent += data.len() as u64;
                        }
                        progress.on_progress(bytes_sent, success_count, error_count);
                        error_count = 0;
                        break;
                    }
                    Some(control::CAN) => {
                        if cancel_pending {
                            // A double CAN answering the digest block is the
                            // receiver's way of saying it already has the file.
                            if !is_data_block {
                                info!("receiver canceled on MD5 block: file already current");
                                return TransferOutcome::Md5Match;
                            }
                            warn!("transmission canceled: 2xCAN during transfer");
                            return TransferOutcome::Failed;
                        }
                        debug!("first CAN during transfer");
                        cancel_pending = true;
                    }
                    Some(control::NAK) => debug!("block {sequence} NAKed, resending"),
                    Some(byte) => debug!("unexpected response {byte:#04x} to block {sequence}"),
                    None => debug!("timeout waiting for response to block {sequence}"),
                }

                error_count += 1;
                progress.on_progress(bytes_sent, success_count, error_count);
                if error_count > retry {
                    warn!("block {sequence} failed after {retry} retries, aborting");
                    self.abort(2, timeout);
                    return TransferOutcome::Failed;
                }
            }

            sequence = sequence.wrapping_add(1);
        }

        // EOT handshake; keeps spending the same error budget.
        loop {
            debug!("sending EOT");
            let _ = self.put1(control::EOT, timeout);
            match self.get1(timeout) {
                Some(control::ACK) => break,
                other => {
                    debug!("EOT response {other:?}, expected ACK");
                    error_count += 1;
                    if error_count > retry {
                        warn!("EOT not acknowledged after {retry} attempts, aborting");
                        self.abort(2, timeout);
                        return TransferOutcome::Failed;
                    }
                }
            }
        }

        info!("XMODEM send complete: {success_count} blocks, {bytes_sent} bytes");
        TransferOutcome::Complete(bytes_sent)
    }

    /// Receive a file (the controller side of an `upload`).
    ///
    /// Emits `C` to request CRC16 mode for the first half of the retry
    /// budget, then downgrades to NAK probes and the one-byte sum. The
    /// block mode is fixed by the first SOH/STX header. When the
    /// sequence-0 digest equals `expected_md5` the transfer is cut
    /// short with [`TransferOutcome::Md5Match`] and nothing is written
    /// to `sink`.
    #[allow(clippy::too_many_lines)]
    pub fn receive(
        &mut self,
        sink: &mut impl Write,
        expected_md5: &str,
        crc_mode_preferred: bool,
        progress: &mut impl Progress,
    ) -> TransferOutcome {
        let retry = self.config.retry;
        let timeout = self.config.timeout;
        let delay = self.config.delay;

        info!("XMODEM receive: expected_md5={expected_md5}, crc={crc_mode_preferred}");

        // Handshake: probe with C, fall back to NAK once half the
        // budget is spent.
        let mut error_count: u32 = 0;
        let mut cancel_pending = false;
        let mut crc_mode = crc_mode_preferred;
        let mut header: Option<u8>;
        loop {
            if error_count >= retry {
                warn!("handshake failed after {retry} errors, aborting");
                self.abort(2, timeout);
                return TransferOutcome::Failed;
            } else if crc_mode && error_count < retry / 2 {
                debug!("sending CRC request (attempt {})", error_count + 1);
                if self.put1(control::CRC, timeout).is_none() {
                    thread::sleep(delay);
                    error_count += 1;
                }
            } else {
                if crc_mode {
                    debug!("falling back to simple checksum mode");
                    crc_mode = false;
                }
                debug!("sending NAK request (attempt {})", error_count + 1);
                if self.put1(control::NAK, timeout).is_none() {
                    thread::sleep(delay);
                    error_count += 1;
                }
            }

            header = self.get1(timeout);
            match header {
                None => {
                    debug!("handshake timeout, no response from sender");
                    error_count += 1;
                }
                Some(control::SOH) => {
                    if !self.mode_set {
                        self.config.mode = BlockMode::Standard;
                        self.mode_set = true;
                    }
                    info!("handshake complete: 128-byte blocks");
                    break;
                }
                Some(control::STX) => {
                    if !self.mode_set {
                        self.config.mode = BlockMode::Extended8k;
                        self.mode_set = true;
                    }
                    info!("handshake complete: 8K blocks");
                    break;
                }
                Some(control::CAN) => {
                    if cancel_pending {
                        warn!("transmission canceled: 2xCAN at start sequence");
                        return TransferOutcome::Canceled;
                    }
                    debug!("first CAN at start sequence");
                    cancel_pending = true;
                }
                Some(byte) => {
                    debug!("unexpected handshake response {byte:#04x}");
                    error_count += 1;
                }
            }
        }

        // Block phase.
        let mode = self.config.mode;
        let packet_size = mode.packet_size();
        let prefix = mode.prefix_len();
        let crc_len = if crc_mode { 2usize } else { 1 };

        let mut error_count: u32 = 0;
        let mut success_count: u32 = 0;
        let mut income_size: u64 = 0;
        let mut sequence: u8 = 0;
        let mut cancel_pending = false;
        let mut retrans: i64 = i64::from(retry) + 1;
        let mut md5_received = false;

        'blocks: loop {
            if self.cancel.is_canceled() {
                self.cancel_transfer(timeout);
                return TransferOutcome::Canceled;
            }

            // Resolve the next header byte.
            loop {
                match header {
                    Some(b) if b == control::SOH || b == control::STX => break,
                    Some(control::EOT) => {
                        debug!("EOT received, sending final ACK");
                        let _ = self.put1(control::ACK, timeout);
                        info!("XMODEM receive complete: {income_size} bytes");
                        return TransferOutcome::Complete(income_size);
                    }
                    Some(control::CAN) => {
                        if cancel_pending {
                            warn!("transmission canceled: 2xCAN at block {sequence}");
                            return TransferOutcome::Canceled;
                        }
                        debug!("first CAN at block {sequence}");
                        cancel_pending = true;
                        header = self.get1(timeout);
                    }
                    None => {
                        error_count += 1;
                        if error_count > retry {
                            warn!("silent line after {retry} errors, aborting");
                            self.abort(2, ABORT_TIMEOUT);
                            return TransferOutcome::Failed;
                        }
                        header = self.get1(HEADER_RETRY_TIMEOUT);
                    }
                    Some(byte) => {
                        warn!("recv error: expected SOH or EOT, got {byte:#04x}");
                        error_count += 1;
                        if error_count > retry {
                            self.abort(2, ABORT_TIMEOUT);
                            return TransferOutcome::Failed;
                        }
                        self.drain_input(timeout);
                        let _ = self.put1(control::NAK, timeout);
                        header = self.get1(timeout);
                    }
                }
            }

            error_count = 0;
            cancel_pending = false;
            debug!("processing block {sequence}");

            // Sequence byte and its complement.
            let seq1 = self.get1(timeout);
            let seq2 = match seq1 {
                Some(_) => self.get1(timeout).map(|b| 0xFF - b),
                None => None,
            };

            let mut block_valid = false;
            if seq1 == Some(sequence) && seq2 == Some(sequence) {
                let expected_len = prefix + packet_size + crc_len;
                if let Some(data) = self.port.get(expected_len, timeout) {
                    if let Some(payload) = Self::verify_checksum(crc_mode, &data) {
                        retrans = i64::from(retry) + 1;
                        if sequence == 0 && !md5_received {
                            md5_received = true;
                            let digest = &payload[prefix..prefix + MD5_LEN];
                            if expected_md5.as_bytes() == digest {
                                info!("MD5 match, canceling transfer");
                                let _ = self.put1(control::CAN, timeout);
                                let _ = self.put1(control::CAN, timeout);
                                let _ = self.put1(control::CAN, timeout);
                                self.drain_input(timeout);
                                return TransferOutcome::Md5Match;
                            }
                            debug!(
                                "MD5 mismatch: expected {expected_md5}, got {}",
                                String::from_utf8_lossy(digest)
                            );
                        } else {
                            let declared = if prefix == 2 {
                                (usize::from(payload[0]) << 8) | usize::from(payload[1])
                            } else {
                                usize::from(payload[0])
                            };
                            // A corrupt length field must not read past the payload.
                            let data_len = declared.min(packet_size);
                            let actual = &payload[prefix..prefix + data_len];
                            income_size += actual.len() as u64;
                            if sink.write_all(actual).is_err() {
                                warn!("sink write failed, aborting");
                                self.abort(2, ABORT_TIMEOUT);
                                return TransferOutcome::Failed;
                            }
                            success_count += 1;
                            debug!(
                                "block {sequence}: {} bytes written, total {income_size}",
                                actual.len()
                            );
                            progress.on_progress(income_size, success_count, error_count);
                        }

                        let _ = self.put1(control::ACK, timeout);
                        sequence = sequence.wrapping_add(1);
                        header = self.get1(timeout);
                        block_valid = true;
                    }
                } else {
                    debug!("short packet read for block {sequence}");
                }
            } else {
                // Wrong sequence: consume the block body anyway, then NAK.
                warn!(
                    "sequence mismatch: expected {sequence}, got {seq1:?}/{seq2:?}, discarding"
                );
                let _ = self.port.get(2 + packet_size + 1 + (crc_len - 1), timeout);
            }

            if block_valid {
                continue 'blocks;
            }

            // Bad block: purge the line and ask for a retransmission.
            warn!("recv error: purge, requesting retransmission");
            self.drain_input(timeout);
            retrans -= 1;
            if retrans <= 0 {
                warn!("too many retransmissions, aborting");
                self.abort(2, ABORT_TIMEOUT);
                return TransferOutcome::Failed;
            }
            let _ = self.put1(control::NAK, timeout);
            header = self.get1(timeout);
        }
    }
}

/// Read up to `size` bytes from `stream`, short only at end of input.
fn read_chunk(stream: &mut impl Read, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
