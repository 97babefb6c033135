//! In-memory gateway and client doubles for tunnel and broker tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

use wh_core::traits::{ChannelOpener, GatewayConnection, GatewayDialer, GatewayListener};
use wh_core::types::BindAddress;
use wh_core::TunnelError;
use wh_protocol::ForwardedTcpip;

const PIPE_CAPACITY: usize = 4096;

/// Port the mock gateway hands out when asked to listen on port 0
pub const ASSIGNED_PORT: u32 = 41234;
const WAIT: Duration = Duration::from_secs(5);

/// The gateway's side of a mock connection: lets a test play remote visitors
pub struct MockGatewayEnd {
    incoming: Mutex<Option<mpsc::UnboundedSender<DuplexStream>>>,
    closed: Arc<AtomicBool>,
    listening_on: Arc<Mutex<Option<BindAddress>>>,
}

impl MockGatewayEnd {
    /// Simulate a visitor connecting to the gateway's listening port
    pub async fn connect(&self) -> DuplexStream {
        let (near, far) = duplex(PIPE_CAPACITY);
        let incoming = self.incoming.lock().unwrap();
        incoming
            .as_ref()
            .expect("listener already shut")
            .send(near)
            .expect("tunnel dropped its listener");
        far
    }

    /// Simulate the gateway session going away
    pub fn shut_listener(&self) {
        self.incoming.lock().unwrap().take();
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn listening_on(&self) -> Option<BindAddress> {
        self.listening_on.lock().unwrap().clone()
    }
}

pub struct MockConnection {
    listener: Option<MockListener>,
    refuse_listen: bool,
    hang_listen: bool,
    closed: Arc<AtomicBool>,
    listening_on: Arc<Mutex<Option<BindAddress>>>,
}

impl MockConnection {
    pub fn new() -> (Self, MockGatewayEnd) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let listening_on = Arc::new(Mutex::new(None));
        let connection = Self {
            listener: Some(MockListener {
                incoming: rx,
                address: BindAddress::new("127.0.0.1", 0),
            }),
            refuse_listen: false,
            hang_listen: false,
            closed: Arc::clone(&closed),
            listening_on: Arc::clone(&listening_on),
        };
        let end = MockGatewayEnd {
            incoming: Mutex::new(Some(tx)),
            closed,
            listening_on,
        };
        (connection, end)
    }

    /// Bypass `listen` for tests that build tunnels directly
    pub fn take_listener(&mut self) -> MockListener {
        self.listener.take().expect("listener already taken")
    }
}

#[async_trait]
impl GatewayConnection for MockConnection {
    type Listener = MockListener;

    async fn listen(&mut self, address: &BindAddress) -> Result<MockListener, TunnelError> {
        if self.refuse_listen {
            return Err(TunnelError::Listen {
                address: address.to_string(),
                reason: "address in use".to_string(),
            });
        }
        if self.hang_listen {
            std::future::pending::<()>().await;
        }
        let mut listener = self.listener.take().ok_or(TunnelError::AlreadyListening)?;
        listener.address = address.clone();
        if address.port == 0 {
            listener.address.port = ASSIGNED_PORT;
        }
        *self.listening_on.lock().unwrap() = Some(listener.address.clone());
        Ok(listener)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    address: BindAddress,
}

#[async_trait]
impl GatewayListener for MockListener {
    type Stream = DuplexStream;

    fn address(&self) -> &BindAddress {
        &self.address
    }

    async fn accept(&mut self) -> Result<DuplexStream, TunnelError> {
        self.incoming.recv().await.ok_or(TunnelError::ListenerClosed)
    }
}

/// What a [`MockDialer`] does when asked to dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    Connect,
    Refuse,
    Hang,
    RefuseListen,
    /// Connects, then never answers the listen request
    HangListen,
}

pub struct MockDialer {
    behavior: DialBehavior,
    dials: AtomicUsize,
    ends: Mutex<Vec<Arc<MockGatewayEnd>>>,
}

impl MockDialer {
    pub fn new(behavior: DialBehavior) -> Self {
        Self {
            behavior,
            dials: AtomicUsize::new(0),
            ends: Mutex::new(Vec::new()),
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Gateway end of the most recent successful dial
    pub fn last_end(&self) -> Option<Arc<MockGatewayEnd>> {
        self.ends.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GatewayDialer for MockDialer {
    type Connection = MockConnection;

    async fn dial(&self) -> Result<MockConnection, TunnelError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            DialBehavior::Refuse => Err(TunnelError::Dial {
                address: "gateway.test:22".to_string(),
                reason: "connection refused".to_string(),
            }),
            DialBehavior::Hang => std::future::pending().await,
            DialBehavior::Connect | DialBehavior::RefuseListen | DialBehavior::HangListen => {
                let (mut connection, end) = MockConnection::new();
                connection.refuse_listen = self.behavior == DialBehavior::RefuseListen;
                connection.hang_listen = self.behavior == DialBehavior::HangListen;
                self.ends.lock().unwrap().push(Arc::new(end));
                Ok(connection)
            }
        }
    }
}

/// Stands in for the client session: every forwarded channel it opens is
/// one half of a duplex pipe, the other half goes to the test
#[derive(Clone)]
pub struct MockOpener {
    inner: Arc<OpenerInner>,
}

struct OpenerInner {
    fail: bool,
    opened: AtomicUsize,
    last_open: Mutex<Option<ForwardedTcpip>>,
    channels_tx: mpsc::UnboundedSender<DuplexStream>,
    channels_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// An opener whose client refuses every channel
    pub fn failing() -> Self {
        Self::build(true)
    }

    fn build(fail: bool) -> Self {
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(OpenerInner {
                fail,
                opened: AtomicUsize::new(0),
                last_open: Mutex::new(None),
                channels_tx,
                channels_rx: tokio::sync::Mutex::new(channels_rx),
            }),
        }
    }

    /// Client end of the next channel the tunnel opens
    pub async fn next_channel(&self) -> DuplexStream {
        let mut rx = self.inner.channels_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no forwarded channel was opened")
            .expect("opener dropped")
    }

    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn last_open(&self) -> Option<ForwardedTcpip> {
        self.inner.last_open.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelOpener for MockOpener {
    type Stream = DuplexStream;

    async fn open_forwarded(&self, open: &ForwardedTcpip) -> Result<DuplexStream, TunnelError> {
        *self.inner.last_open.lock().unwrap() = Some(open.clone());
        if self.inner.fail {
            return Err(TunnelError::ChannelOpen("administratively prohibited".to_string()));
        }
        let (near, far) = duplex(PIPE_CAPACITY);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.channels_tx.send(far);
        Ok(near)
    }
}
