//! Mock CNC controller server.
//!
//! A line-oriented TCP server that impersonates a mill: commands are
//! answered from the [`CommandCatalog`], files live in a
//! [`VirtualFileStore`], and `upload`/`download` hand the socket over
//! to the XMODEM engine. Exactly one client is served at a time; a
//! second connection is turned away with a busy error, the same way
//! the machine's single command port behaves.

mod session;

use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::CancelFlag;
use crate::catalog::CommandCatalog;
use crate::cnc::CncState;
use crate::error::Result;
use crate::vfs::VirtualFileStore;

use session::Session;

/// Reply sent to a second concurrent connection before closing it.
const BUSY_RESPONSE: &[u8] = b"ERROR: Server busy, only one connection allowed\n";

/// Default listen host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 2222;

/// Mutable controller state owned by the single active session.
#[derive(Debug, Default)]
pub struct ControllerState {
    /// The mill's virtual filesystem.
    pub store: VirtualFileStore,
    /// Tracked machine state and simulated clock.
    pub cnc: CncState,
}

pub(crate) struct ServerShared {
    pub(crate) catalog: CommandCatalog,
    pub(crate) state: Mutex<ControllerState>,
    pub(crate) transfer_cancel: CancelFlag,
    active: AtomicBool,
}

/// The mock controller.
pub struct MockServer {
    shared: Arc<ServerShared>,
}

impl MockServer {
    /// Create a server from a catalog and seed files.
    pub fn new(catalog: CommandCatalog, store: VirtualFileStore) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                catalog,
                state: Mutex::new(ControllerState {
                    store,
                    cnc: CncState::new(),
                }),
                transfer_cancel: CancelFlag::default(),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Create a server with the built-in catalog and seed files.
    pub fn builtin() -> Self {
        Self::new(CommandCatalog::builtin(), VirtualFileStore::builtin())
    }

    /// Cancellation flag honored at transfer block boundaries.
    ///
    /// Setting it makes an in-flight XMODEM transfer shut down with a
    /// clean CAN sequence instead of an abrupt close.
    pub fn transfer_cancel(&self) -> CancelFlag {
        self.shared.transfer_cancel.clone()
    }

    /// Bind a listener on `host:port`.
    pub fn bind(host: &str, port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind((host, port))?;
        info!(
            "mock CNC server listening on {}",
            listener.local_addr().map_or_else(
                |_| format!("{host}:{port}"),
                |a| a.to_string()
            )
        );
        Ok(listener)
    }

    /// Serve connections forever.
    ///
    /// Each accepted socket gets its own thread; all but the first
    /// live connection are immediately rejected with a busy error.
    pub fn serve(&self, listener: &TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => self.handle_connection(stream),
                Err(e) => warn!("accept failed: {e}"),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) {
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
            info!("client connected from {peer}");

            if shared
                .active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!("rejecting concurrent connection from {peer}");
                reject_busy(stream);
                return;
            }

            let result = Session::new(stream, peer.clone(), Arc::clone(&shared)).run();
            shared.active.store(false, Ordering::SeqCst);

            match result {
                Ok(()) => info!("client {peer} disconnected"),
                Err(e) => warn!("session with {peer} ended with error: {e}"),
            }
        });
    }
}

fn reject_busy(mut stream: TcpStream) {
    use std::io::Write;
    let _ = stream.write_all(BUSY_RESPONSE);
    let _ = stream.flush();
    let _ = stream.shutdown(std::net::Shutdown::Both);
}
