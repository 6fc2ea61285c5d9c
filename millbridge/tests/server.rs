//! End-to-end tests: a real mock controller on an ephemeral port,
//! driven by a TCP client that uses the library's own engine for the
//! transfer scenarios.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use millbridge::{
    BlockMode, CommandCatalog, MockServer, NoProgress, TcpByteStream, TransferOutcome,
    VirtualFileStore, Xmodem, XmodemConfig, md5_hex,
};

/// Start a fresh server on an ephemeral port.
fn start_server() -> SocketAddr {
    let server = MockServer::new(CommandCatalog::builtin(), VirtualFileStore::builtin());
    let listener = MockServer::bind("127.0.0.1", 0).expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || server.serve(&listener));
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

fn send_line(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).expect("write line");
    stream.write_all(b"\n").expect("write newline");
    stream.flush().expect("flush");
}

/// Read one LF-terminated line, byte at a time. Unbuffered so that
/// XMODEM bytes following a line are never swallowed.
fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
            Err(e) => panic!("read_line failed: {e}"),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn roundtrip(stream: &mut TcpStream, command: &str) -> String {
    send_line(stream, command);
    read_line(stream)
}

fn client_config(mode: BlockMode) -> XmodemConfig {
    XmodemConfig {
        mode,
        retry: 16,
        timeout: Duration::from_secs(5),
        ..XmodemConfig::default()
    }
}

/// Upload `payload` to `path` over the wire, playing the sender role.
fn upload(stream: &mut TcpStream, path: &str, payload: &[u8], mode: BlockMode) -> TransferOutcome {
    send_line(stream, &format!("upload {path}"));
    let md5 = md5_hex(payload);
    let mut adapter = TcpByteStream::new(stream);
    let mut engine = Xmodem::with_config(&mut adapter, client_config(mode));
    engine.send(&mut std::io::Cursor::new(payload.to_vec()), &md5, &mut NoProgress)
}

/// Download `path` from the server, playing the receiver role.
fn download(
    stream: &mut TcpStream,
    path: &str,
    expected_md5: &str,
    timeout: Duration,
) -> (TransferOutcome, Vec<u8>) {
    send_line(stream, &format!("download {path}"));
    let mut sink = Vec::new();
    let outcome = {
        let mut adapter = TcpByteStream::new(stream);
        let config = XmodemConfig {
            timeout,
            ..client_config(BlockMode::Extended8k)
        };
        let mut engine = Xmodem::with_config(&mut adapter, config);
        engine.receive(&mut sink, expected_md5, true, &mut NoProgress)
    };
    (outcome, sink)
}

#[test]
fn version_command_answers_after_think_time() {
    let addr = start_server();
    let mut client = connect(addr);

    let started = Instant::now();
    let reply = roundtrip(&mut client, "version");
    let elapsed = started.elapsed();

    assert_eq!(reply, "version: MillSim 1.0.3, build: community");
    assert_eq!(read_line(&mut client), "ok");
    assert!(elapsed >= Duration::from_millis(100), "think time honored");
}

#[test]
fn second_connection_is_rejected_busy() {
    let addr = start_server();
    let mut first = connect(addr);
    // Make sure the first session is established before racing it.
    let _ = roundtrip(&mut first, "version");
    let _ = read_line(&mut first);

    let started = Instant::now();
    let mut second = connect(addr);
    let reply = read_line(&mut second);
    assert_eq!(reply, "ERROR: Server busy, only one connection allowed");
    assert!(started.elapsed() < Duration::from_millis(500));

    // The second socket is closed right after the error line.
    let mut byte = [0u8; 1];
    assert_eq!(second.read(&mut byte).unwrap_or(0), 0);

    // The first session keeps working.
    let reply = roundtrip(&mut first, "pwd");
    assert_eq!(reply, "/");
}

#[test]
fn unknown_command_keeps_session_alive() {
    let addr = start_server();
    let mut client = connect(addr);

    assert_eq!(roundtrip(&mut client, "frobnicate"), "ERROR: Unknown command");
    assert_eq!(roundtrip(&mut client, "pwd"), "/");
}

#[test]
fn cd_and_pwd_navigate_the_virtual_tree() {
    let addr = start_server();
    let mut client = connect(addr);

    assert_eq!(roundtrip(&mut client, "cd /foo"), "");
    assert_eq!(roundtrip(&mut client, "pwd"), "/foo");
    assert_eq!(roundtrip(&mut client, "cd ../bar"), "");
    assert_eq!(roundtrip(&mut client, "pwd"), "/bar");
    assert_eq!(roundtrip(&mut client, "cd"), "");
    assert_eq!(roundtrip(&mut client, "pwd"), "/");
}

#[test]
fn simulated_clock_set_and_query() {
    let addr = start_server();
    let mut client = connect(addr);

    assert_eq!(
        roundtrip(&mut client, "time"),
        "ERROR: Time not initialized"
    );
    assert_eq!(roundtrip(&mut client, "time = 1700000000"), "");
    let reported: i64 = roundtrip(&mut client, "time").parse().expect("epoch reply");
    assert!((1_700_000_000..1_700_000_060).contains(&reported));

    assert_eq!(
        roundtrip(&mut client, "time = 9999999999"),
        "ERROR: Invalid time value"
    );
}

#[test]
fn filesystem_commands_against_seed_files() {
    let addr = start_server();
    let mut client = connect(addr);

    let listing = roundtrip(&mut client, "ls /sd");
    assert!(listing.contains("config.txt"));
    // Directory entries arrive on the same response line block.
    let full = format!("{listing}\n{}", read_line(&mut client));
    assert!(full.contains("gcodes/"));

    assert_eq!(roundtrip(&mut client, "cd /sd/gcodes"), "");
    let cat_first = roundtrip(&mut client, "cat demo.nc 1");
    assert_eq!(cat_first, "G21");

    assert_eq!(roundtrip(&mut client, "mv demo.nc part.nc"), "");
    assert_eq!(
        roundtrip(&mut client, "cat demo.nc 1"),
        "ERROR: File not found: /sd/gcodes/demo.nc"
    );
    assert_eq!(roundtrip(&mut client, "cat part.nc 1"), "G21");

    assert_eq!(roundtrip(&mut client, "rm part.nc"), "");
    assert_eq!(
        roundtrip(&mut client, "cat part.nc 1"),
        "ERROR: File not found: /sd/gcodes/part.nc"
    );
}

#[test]
fn upload_then_download_round_trips_file() {
    let addr = start_server();
    let mut client = connect(addr);

    // 5000 bytes of printable text, stored under the given path.
    let payload: Vec<u8> = (0..5000u32)
        .map(|i| b"G1 X10.0 Y2.5\n"[(i as usize) % 14])
        .collect();
    let md5 = md5_hex(&payload);

    let outcome = upload(&mut client, "/test/a.txt", &payload, BlockMode::Extended8k);
    assert_eq!(outcome, TransferOutcome::Complete(5000));

    // Download it back with a non-matching digest to force a transfer.
    let (outcome, received) = download(&mut client, "/test/a.txt", "", Duration::from_secs(5));
    assert_eq!(outcome, TransferOutcome::Complete(5000));
    assert_eq!(received, payload);
    assert_eq!(md5_hex(&received), md5);
    assert_eq!(read_line(&mut client), "", "empty line closes the download");
}

#[test]
fn download_with_current_copy_short_circuits() {
    let addr = start_server();
    let mut client = connect(addr);

    let payload = b"G0 X0\nG1 X5\nM30\n".to_vec();
    let md5 = md5_hex(&payload);
    let outcome = upload(&mut client, "/test/b.nc", &payload, BlockMode::Standard);
    assert_eq!(outcome, TransferOutcome::Complete(payload.len() as u64));

    // The client already holds the file: its receiver cancels on the
    // MD5 block and the server treats that as a clean skip. The
    // receiver's post-cancel purge swallows the server's reply line,
    // so none is read here.
    let (outcome, received) =
        download(&mut client, "/test/b.nc", &md5, Duration::from_millis(500));
    assert_eq!(outcome, TransferOutcome::Md5Match);
    assert!(received.is_empty());

    // Session is still usable afterwards.
    assert_eq!(roundtrip(&mut client, "pwd"), "/");
}

#[test]
fn upload_of_identical_content_reports_md5_match() {
    let addr = start_server();
    let mut client = connect(addr);

    let payload = b"M3 S5000\nM5\n".to_vec();
    let outcome = upload(&mut client, "/test/dup.nc", &payload, BlockMode::Standard);
    assert_eq!(outcome, TransferOutcome::Complete(payload.len() as u64));

    // Re-sending identical bytes: the server's receiver cancels on the
    // digest block, the client's sender reports the match.
    let outcome = upload(&mut client, "/test/dup.nc", &payload, BlockMode::Standard);
    assert_eq!(outcome, TransferOutcome::Md5Match);
    // One CAN of the server's triple may still sit in front of the
    // reply; the sender only consumed two.
    let reply = read_line(&mut client);
    assert_eq!(
        reply.trim_start_matches('\u{16}'),
        "Upload canceled - file already exists with same content"
    );
}

#[test]
fn binary_upload_is_stored_base64_with_suffix() {
    let addr = start_server();
    let mut client = connect(addr);

    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let outcome = upload(&mut client, "/test/blob.bin", &payload, BlockMode::Standard);
    assert_eq!(outcome, TransferOutcome::Complete(1000));

    let listing = roundtrip(&mut client, "ls -s /test");
    assert!(
        listing.contains("blob.bin.b64"),
        "binary upload stored under .b64 path, got: {listing}"
    );

    let encoded = roundtrip(&mut client, "cat /test/blob.bin.b64");
    assert_eq!(BASE64.decode(encoded.as_bytes()).expect("valid base64"), payload);
}

#[test]
fn missing_download_never_enters_transfer_regime() {
    let addr = start_server();
    let mut client = connect(addr);

    let reply = roundtrip(&mut client, "download /no/such/file.nc");
    assert_eq!(reply, "ERROR: File not found: /no/such/file.nc");

    // Still in the line regime.
    assert_eq!(roundtrip(&mut client, "pwd"), "/");
}

#[test]
#[ignore = "takes 11 wall-clock seconds"]
fn idle_session_closes_after_ten_seconds() {
    let addr = start_server();
    let mut client = connect(addr);
    let _ = roundtrip(&mut client, "version");
    let _ = read_line(&mut client);

    let started = Instant::now();
    client
        .set_read_timeout(Some(Duration::from_secs(12)))
        .expect("read timeout");
    let mut byte = [0u8; 1];
    let n = client.read(&mut byte).unwrap_or(0);
    let elapsed = started.elapsed();

    assert_eq!(n, 0, "server closed the connection");
    assert!(elapsed >= Duration::from_millis(9_800), "not before 10 s");
    assert!(elapsed <= Duration::from_millis(11_000), "not much after 10 s");
}
