//! TCP transport: every stage is a separate process
//!
//! Each stage listens on its own address. Outgoing messages to a peer are
//! queued to a writer thread owning the connection, so [`Transport::isend`]
//! never blocks; a send completes once its frame has been written. Reader
//! threads feed arriving frames into the stage's matching engine.
//!
//! Stream layout: the connecting stage first writes its stage id as one
//! little-endian u64, then frames of `tag: u64`, `len: u64`, `len` words,
//! all little-endian.

use super::matcher::Matcher;
use super::{Completion, Tag, Transport};
use crate::codec::MAX_PAYLOAD_WORDS;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const CONNECT_RETRY: Duration = Duration::from_millis(20);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
enum SendState {
    Queued,
    Writing,
    Written,
    Cancelled,
    Failed(String),
}

struct SendStatus {
    state: Mutex<SendState>,
    changed: Condvar,
}

impl SendStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SendState::Queued),
            changed: Condvar::new(),
        })
    }

    /// Claim the frame for writing; false if it was cancelled first
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SendState::Cancelled {
            return false;
        }
        *state = SendState::Writing;
        true
    }

    fn finish(&self, outcome: SendState) {
        *self.state.lock() = outcome;
        self.changed.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == SendState::Queued {
            *state = SendState::Cancelled;
        }
    }

    fn poll(&self) -> Result<Option<Completion>> {
        Self::outcome(&self.state.lock())
    }

    fn outcome(state: &SendState) -> Result<Option<Completion>> {
        match state {
            SendState::Written => Ok(Some(Completion::Sent)),
            SendState::Failed(reason) => Err(Error::Transport(reason.clone())),
            SendState::Cancelled => Err(Error::Transport("send was cancelled".to_string())),
            SendState::Queued | SendState::Writing => Ok(None),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Completion> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(done) = Self::outcome(&state)? {
                return Ok(done);
            }
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Transport("timed out writing frame".to_string()));
                    }
                    let _ = self.changed.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

struct Outgoing {
    tag: Tag,
    words: Vec<u64>,
    status: Arc<SendStatus>,
}

enum RequestKind {
    Send(Arc<SendStatus>),
    Recv {
        source: usize,
        tag: Tag,
        id: u64,
        len: usize,
    },
}

/// Outstanding request on a [`TcpTransport`]
pub struct TcpRequest(RequestKind);

/// Endpoint of one stage
pub struct TcpTransport {
    stage_id: usize,
    peers: Vec<SocketAddr>,
    inbox: Arc<Matcher>,
    writers: HashMap<usize, kanal::Sender<Outgoing>>,
    shutdown: Arc<AtomicBool>,
    timeout: Option<Duration>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Listen on `peers[stage_id]`
    pub fn bind(stage_id: usize, peers: Vec<SocketAddr>) -> Result<Self> {
        let addr = *peers.get(stage_id).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "stage {} has no address among {} peers",
                stage_id,
                peers.len()
            ))
        })?;
        let listener = TcpListener::bind(addr)?;
        Self::from_listener(stage_id, listener, peers)
    }

    /// Use an already bound listener for this stage
    pub fn from_listener(
        stage_id: usize,
        listener: TcpListener,
        peers: Vec<SocketAddr>,
    ) -> Result<Self> {
        if stage_id >= peers.len() {
            return Err(Error::InvalidConfig(format!(
                "stage {} has no address among {} peers",
                stage_id,
                peers.len()
            )));
        }
        listener.set_nonblocking(true)?;
        let inbox = Arc::new(Matcher::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let inbox = Arc::clone(&inbox);
            let shutdown = Arc::clone(&shutdown);
            let stages = peers.len();
            thread::Builder::new()
                .name(format!("slicepipe-accept-{}", stage_id))
                .spawn(move || accept_loop(listener, inbox, shutdown, stages))?;
        }
        tracing::debug!(stage = stage_id, peers = peers.len(), "tcp transport listening");

        Ok(Self {
            stage_id,
            peers,
            inbox,
            writers: HashMap::new(),
            shutdown,
            timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Fail blocking waits after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Give up connecting to a peer after `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn writer(&mut self, dest: usize) -> Result<&kanal::Sender<Outgoing>> {
        if !self.writers.contains_key(&dest) {
            let addr = *self.peers.get(dest).ok_or_else(|| {
                Error::Transport(format!(
                    "stage {} outside transport of {} stages",
                    dest,
                    self.peers.len()
                ))
            })?;
            let (tx, rx) = kanal::unbounded();
            let stage_id = self.stage_id;
            let connect_timeout = self.connect_timeout;
            thread::Builder::new()
                .name(format!("slicepipe-send-{}-{}", stage_id, dest))
                .spawn(move || write_loop(addr, stage_id, rx, connect_timeout))?;
            self.writers.insert(dest, tx);
        }
        self.writers
            .get(&dest)
            .ok_or_else(|| Error::Transport(format!("no writer for stage {}", dest)))
    }
}

impl Transport for TcpTransport {
    type Request = TcpRequest;

    fn stage_id(&self) -> usize {
        self.stage_id
    }

    fn stage_count(&self) -> usize {
        self.peers.len()
    }

    fn isend(&mut self, dest: usize, tag: Tag, words: &[u64]) -> Result<TcpRequest> {
        let status = SendStatus::new();
        let outgoing = Outgoing {
            tag,
            words: words.to_vec(),
            status: Arc::clone(&status),
        };
        self.writer(dest)?
            .send(outgoing)
            .map_err(|e| Error::Transport(format!("writer for stage {} is gone: {}", dest, e)))?;
        Ok(TcpRequest(RequestKind::Send(status)))
    }

    fn irecv(&mut self, source: usize, tag: Tag, len: usize) -> Result<TcpRequest> {
        if source >= self.peers.len() {
            return Err(Error::Transport(format!(
                "stage {} outside transport of {} stages",
                source,
                self.peers.len()
            )));
        }
        let id = self.inbox.post(source, tag);
        Ok(TcpRequest(RequestKind::Recv {
            source,
            tag,
            id,
            len,
        }))
    }

    fn test(&mut self, request: &mut TcpRequest) -> Result<Option<Completion>> {
        match &request.0 {
            RequestKind::Send(status) => status.poll(),
            RequestKind::Recv { tag, id, len, .. } => match self.inbox.try_take(*id)? {
                Some(words) => received(*tag, *len, words).map(Some),
                None => Ok(None),
            },
        }
    }

    fn wait(&mut self, request: &mut TcpRequest) -> Result<Completion> {
        match &request.0 {
            RequestKind::Send(status) => status.wait(self.timeout),
            RequestKind::Recv { tag, id, len, .. } => {
                let words = self.inbox.take(*id, self.timeout)?;
                received(*tag, *len, words)
            }
        }
    }

    fn cancel(&mut self, request: TcpRequest) -> Result<()> {
        match request.0 {
            RequestKind::Send(status) => status.cancel(),
            RequestKind::Recv {
                source, tag, id, ..
            } => self.inbox.cancel_posted(source, tag, id),
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // dropping the senders lets every writer drain its queue and exit
        self.writers.clear();
    }
}

fn received(tag: Tag, expected: usize, words: Vec<u64>) -> Result<Completion> {
    if words.len() != expected {
        return Err(Error::LengthMismatch {
            tag,
            expected,
            actual: words.len(),
        });
    }
    Ok(Completion::Received(words))
}

fn accept_loop(
    listener: TcpListener,
    inbox: Arc<Matcher>,
    shutdown: Arc<AtomicBool>,
    stages: usize,
) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let reader_inbox = Arc::clone(&inbox);
                let spawned = thread::Builder::new()
                    .name(format!("slicepipe-recv-{}", addr))
                    .spawn(move || {
                        if let Err(e) = read_loop(stream, &reader_inbox, stages) {
                            tracing::warn!(peer = %addr, error = %e, "connection lost");
                            reader_inbox.close(format!("connection from {} lost: {}", addr, e));
                        }
                    });
                if let Err(e) = spawned {
                    inbox.close(format!("cannot spawn reader: {}", e));
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                inbox.close(format!("accept failed: {}", e));
                return;
            }
        }
    }
}

fn read_u64(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Read the handshake of a connecting stage
fn read_source(reader: &mut impl Read, stages: usize) -> Result<usize> {
    let source = read_u64(reader)?;
    if source >= stages as u64 {
        return Err(Error::Transport(format!(
            "peer announced stage {} outside transport of {} stages",
            source, stages
        )));
    }
    Ok(source as usize)
}

fn read_loop(stream: TcpStream, inbox: &Matcher, stages: usize) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream);
    let source = read_source(&mut reader, stages)?;
    tracing::debug!(source, "peer connected");
    loop {
        let tag = match read_u64(&mut reader) {
            Ok(tag) => tag,
            // the peer closed between frames
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = read_u64(&mut reader)?;
        let tag = Tag::try_from(tag)
            .map_err(|_| Error::Transport(format!("frame tag {} out of range", tag)))?;
        if len >= MAX_PAYLOAD_WORDS {
            return Err(Error::Transport(format!("frame of {} words rejected", len)));
        }
        let mut bytes = vec![0u8; len as usize * 8];
        reader.read_exact(&mut bytes)?;
        let words = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        inbox.deliver(source, tag, words, None);
    }
}

fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    }
}

fn encode_frame(tag: Tag, words: &[u64]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + words.len() * 8);
    frame.extend_from_slice(&u64::from(tag).to_le_bytes());
    frame.extend_from_slice(&(words.len() as u64).to_le_bytes());
    for word in words {
        frame.extend_from_slice(&word.to_le_bytes());
    }
    frame
}

fn write_loop(
    addr: SocketAddr,
    stage_id: usize,
    rx: kanal::Receiver<Outgoing>,
    connect_timeout: Duration,
) {
    let opened = connect(addr, connect_timeout).and_then(|mut stream| {
        stream.set_nodelay(true)?;
        stream.write_all(&(stage_id as u64).to_le_bytes())?;
        Ok(stream)
    });
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(peer = %addr, error = %e, "cannot connect");
            fail_remaining(&rx, &format!("cannot connect to {}: {}", addr, e));
            return;
        }
    };

    while let Ok(outgoing) = rx.recv() {
        if !outgoing.status.begin() {
            continue;
        }
        match stream.write_all(&encode_frame(outgoing.tag, &outgoing.words)) {
            Ok(()) => outgoing.status.finish(SendState::Written),
            Err(e) => {
                tracing::error!(peer = %addr, error = %e, "write failed");
                let reason = format!("write to {} failed: {}", addr, e);
                outgoing.status.finish(SendState::Failed(reason.clone()));
                fail_remaining(&rx, &reason);
                return;
            }
        }
    }
}

fn fail_remaining(rx: &kanal::Receiver<Outgoing>, reason: &str) {
    while let Ok(outgoing) = rx.recv() {
        outgoing.status.finish(SendState::Failed(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TcpTransport, TcpTransport) {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let peers = vec![a.local_addr().unwrap(), b.local_addr().unwrap()];
        let ta = TcpTransport::from_listener(0, a, peers.clone())
            .unwrap()
            .with_timeout(Duration::from_secs(10));
        let tb = TcpTransport::from_listener(1, b, peers)
            .unwrap()
            .with_timeout(Duration::from_secs(10));
        (ta, tb)
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(3, &[1, u64::MAX]);
        assert_eq!(frame.len(), 32);
        assert_eq!(&frame[..8], &3u64.to_le_bytes());
        assert_eq!(&frame[8..16], &2u64.to_le_bytes());
        assert_eq!(&frame[24..], &[0xff; 8]);
    }

    #[test]
    fn test_roundtrip_over_loopback() {
        let (mut a, mut b) = pair();
        let mut send = a.isend(1, 5, &[10, 20, 30]).unwrap();
        let mut empty = a.isend(1, 6, &[]).unwrap();
        assert_eq!(a.wait(&mut send).unwrap(), Completion::Sent);
        assert_eq!(a.wait(&mut empty).unwrap(), Completion::Sent);

        let mut recv = b.irecv(0, 5, 3).unwrap();
        assert_eq!(
            b.wait(&mut recv).unwrap(),
            Completion::Received(vec![10, 20, 30])
        );
        let mut recv = b.irecv(0, 6, 0).unwrap();
        assert_eq!(b.wait(&mut recv).unwrap(), Completion::Received(vec![]));
    }

    #[test]
    fn test_not_device_aware() {
        let (a, _b) = pair();
        assert!(!a.device_aware());
        assert_eq!(a.stage_count(), 2);
    }

    #[test]
    fn test_handshake_rejects_unknown_stage() {
        let known = 1u64.to_le_bytes();
        assert_eq!(read_source(&mut &known[..], 2).unwrap(), 1);

        let unknown = 7u64.to_le_bytes();
        assert!(matches!(
            read_source(&mut &unknown[..], 2),
            Err(Error::Transport(_))
        ));
        assert!(read_source(&mut &[1u8, 0][..], 2).is_err());
    }

    #[test]
    fn test_unknown_stage() {
        let (mut a, _b) = pair();
        assert!(a.isend(5, 1, &[1]).is_err());
        assert!(a.irecv(5, 1, 1).is_err());
    }
}
