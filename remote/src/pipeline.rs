// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The socket pipeline event loop and its cross-thread handle.

use crate::connection::{ConnState, Connection, FillOutcome, Stream};
use crate::event::{SocketEvent, SocketEventKind};
use crate::scheduler::{Candidate, Scheduler};
use crate::server::Server;
use crate::sockets;
use crate::{DEFAULT_PORT, DEFAULT_SOCKET_TIMEOUT};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use ipnet::Ipv4Net;
use kernel::codec::encode_kernel;
use kernel::frame::{begin_packet, end_packet};
use kernel::{
    ConnectionSnapshot, ForeignKernel, Kernel, KernelPtr, Link, LinkEnv, LinkFlags, ParentLink,
    Pipeline, PipelineSnapshot, Principal, ResourceVector, ReturnCode, SocketAddress,
};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const WAKER: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Static configuration of one socket pipeline instance.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub name: &'static str,
    /// Daemon port used for listening servers and peer dialling.
    pub port: u16,
    /// Include the local node in the upstream round-robin.
    pub use_localhost: bool,
    pub socket_timeout: Duration,
    /// Bind a UNIX-domain listener too (the control socket).
    pub unix_path: Option<PathBuf>,
    /// Application this process runs as (0 = the daemon itself).
    pub this_application: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            name: "lat-remote",
            port: DEFAULT_PORT,
            use_localhost: true,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            unix_path: None,
            this_application: 0,
        }
    }
}

/// Requests other threads post to the I/O thread.
pub enum Command {
    Send(KernelPtr),
    Forward(Box<ForeignKernel>),
    AddServer {
        net: Ipv4Net,
        port: u16,
        ack: Option<Sender<Result<(), String>>>,
    },
    RemoveServer(Ipv4Net),
    AddClient {
        address: SocketAddress,
        resources: ResourceVector,
    },
    StopClient(SocketAddress),
    SetClientWeight(SocketAddress, u64),
    DropApplications(Vec<u64>),
    Snapshot(Sender<PipelineSnapshot>),
    Shutdown,
}

/// Cross-thread handle; implements [`Pipeline`] by enqueueing commands
/// and waking the poller.
pub struct SocketPipelineHandle {
    name: &'static str,
    cmd: Sender<Command>,
    waker: Arc<Waker>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SocketPipelineHandle {
    fn post(&self, cmd: Command) {
        if self.cmd.send(cmd).is_err() {
            debug!(name = self.name, "socket pipeline is gone");
            return;
        }
        let _ = self.waker.wake();
    }

    pub fn add_server(&self, net: Ipv4Net, port: u16) -> Result<(), String> {
        let (ack, ack_rx) = bounded(1);
        self.post(Command::AddServer {
            net,
            port,
            ack: Some(ack),
        });
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| "socket pipeline did not answer".to_string())?
    }

    pub fn remove_server(&self, net: Ipv4Net) {
        self.post(Command::RemoveServer(net));
    }

    pub fn add_client(&self, address: SocketAddress, resources: ResourceVector) {
        self.post(Command::AddClient { address, resources });
    }

    pub fn stop_client(&self, address: SocketAddress) {
        self.post(Command::StopClient(address));
    }

    pub fn set_client_weight(&self, address: SocketAddress, weight: u64) {
        self.post(Command::SetClientWeight(address, weight));
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<PipelineSnapshot> {
        let (tx, rx) = bounded(1);
        self.post(Command::Snapshot(tx));
        rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    /// Ask the loop to exit and join its thread.
    pub fn stop(&self) {
        self.post(Command::Shutdown);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Pipeline for SocketPipelineHandle {
    fn send(&self, k: KernelPtr) {
        self.post(Command::Send(k));
    }

    fn forward_foreign(&self, fk: Box<ForeignKernel>) {
        self.post(Command::Forward(fk));
    }

    fn drop_application(&self, ids: &[u64]) {
        self.post(Command::DropApplications(ids.to_vec()));
    }
}

/// The unstarted pipeline: owns the poller until `start` moves it onto
/// the I/O thread.
pub struct SocketPipeline {
    config: SocketConfig,
    poll: Poll,
    rx: Receiver<Command>,
    handle: Arc<SocketPipelineHandle>,
}

impl SocketPipeline {
    pub fn create(config: SocketConfig) -> io::Result<(Self, Arc<SocketPipelineHandle>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = unbounded();
        let handle = Arc::new(SocketPipelineHandle {
            name: config.name,
            cmd: tx,
            waker,
            join: Mutex::new(None),
        });
        Ok((
            Self {
                config,
                poll,
                rx,
                handle: handle.clone(),
            },
            handle,
        ))
    }

    /// Spawn the I/O thread. `env` carries the collaborator pipelines
    /// every connection's link routes into.
    pub fn start(self, env: LinkEnv) {
        let name = self.config.name;
        let handle = self.handle.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut lp = Loop::new(self.config, self.poll, self.rx, env);
                lp.run();
            })
            .expect("failed to spawn socket pipeline thread");
        *handle.join.lock() = Some(thread);
    }
}

struct Loop {
    config: SocketConfig,
    poll: Poll,
    rx: Receiver<Command>,
    env: LinkEnv,
    servers: Vec<Server>,
    unix_listener: Option<(mio::net::UnixListener, Token, PathBuf)>,
    conns: HashMap<Token, Connection>,
    clients: BTreeMap<SocketAddress, Token>,
    sched: Scheduler,
    next_token: usize,
    running: bool,
}

impl Loop {
    fn new(config: SocketConfig, poll: Poll, rx: Receiver<Command>, env: LinkEnv) -> Self {
        Self {
            config,
            poll,
            rx,
            env,
            servers: Vec::new(),
            unix_listener: None,
            conns: HashMap::new(),
            clients: BTreeMap::new(),
            sched: Scheduler::default(),
            next_token: 1,
            running: true,
        }
    }

    fn run(&mut self) {
        if let Some(path) = self.config.unix_path.clone() {
            if let Err(err) = self.bind_unix(&path) {
                warn!(name = self.config.name, %err, path = %path.display(),
                      "failed to bind control socket");
            }
        }
        info!(name = self.config.name, "socket pipeline running");
        let mut events = Events::with_capacity(128);
        while self.running {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(name = self.config.name, %err, "poll failed");
                break;
            }
            let tokens: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_error()))
                .collect();
            for (token, readable, writable, errored) in tokens {
                self.handle_event(token, readable, writable, errored);
            }
            while let Ok(cmd) = self.rx.try_recv() {
                self.handle_command(cmd);
            }
            self.expire_starting();
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(mut conn) = self.conns.remove(&token) {
                conn.stream.deregister(self.poll.registry());
                self.clients.remove(&conn.address);
            }
        }
        if let Some((_, _, path)) = self.unix_listener.take() {
            let _ = std::fs::remove_file(path);
        }
        info!(name = self.config.name, "socket pipeline stopped");
    }

    fn next_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn bind_unix(&mut self, path: &PathBuf) -> io::Result<()> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut listener = mio::net::UnixListener::bind(path)?;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
        let token = self.next_token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        info!(name = self.config.name, path = %path.display(), "control socket bound");
        self.unix_listener = Some((listener, token, path.clone()));
        Ok(())
    }

    fn handle_event(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        if token == WAKER {
            return;
        }
        if let Some(idx) = self.servers.iter().position(|s| s.token == token) {
            self.accept_tcp(idx);
            return;
        }
        if self
            .unix_listener
            .as_ref()
            .is_some_and(|(_, t, _)| *t == token)
        {
            self.accept_unix();
            return;
        }
        if !self.conns.contains_key(&token) {
            return;
        }
        if errored {
            self.close(token, true);
            return;
        }
        if writable {
            let flush = {
                let conn = self.conns.get_mut(&token).expect("checked above");
                if conn.state == ConnState::Starting {
                    conn.state = ConnState::Started;
                    debug!(address = %conn.address, "connection started");
                }
                conn.flush(self.poll.registry())
            };
            if flush.is_err() {
                self.close(token, true);
                return;
            }
        }
        if readable {
            let outcome = {
                let conn = self.conns.get_mut(&token).expect("checked above");
                if conn.state == ConnState::Starting {
                    conn.state = ConnState::Started;
                }
                conn.fill()
            };
            match outcome {
                Ok(FillOutcome::Open) => {
                    if self.receive(token).is_err() {
                        self.close(token, true);
                    }
                }
                Ok(FillOutcome::Closed) => {
                    let _ = self.receive(token);
                    self.close(token, false);
                }
                Err(_) => self.close(token, true),
            }
        }
    }

    fn receive(&mut self, token: Token) -> Result<(), kernel::WireError> {
        let conn = self.conns.get_mut(&token).expect("caller checked");
        {
            let Connection {
                link, inbuf, out, ..
            } = &mut *conn;
            link.receive(inbuf, out)?;
        }
        let _ = conn.flush(self.poll.registry());
        Ok(())
    }

    /// Remove a connection. `errored` decides whether the downstream
    /// buffer is recovered too: an orderly close means the peer
    /// acknowledged everything in flight.
    fn close(&mut self, token: Token, errored: bool) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        debug!(address = %conn.address, errored, "closing connection");
        conn.stream.deregister(self.poll.registry());
        self.clients.remove(&conn.address);
        let use_localhost = self.config.use_localhost;
        {
            let Self {
                sched,
                conns,
                clients,
                ..
            } = self;
            sched.on_remove(
                &conn.address,
                clients,
                |a| {
                    clients.get(a).and_then(|t| conns.get(t)).map(|c| Candidate {
                        weight: c.weight,
                        started: c.is_started(),
                    })
                },
                use_localhost,
            );
        }
        conn.state = ConnState::Stopped;
        conn.link.recover(errored);
        self.fire_event(SocketEventKind::ClientRemoved, conn.address.clone());
    }

    fn new_link(&self) -> Link {
        Link::new(
            self.env.clone(),
            self.config.this_application,
            LinkFlags::SAVE_UPSTREAM | LinkFlags::SAVE_DOWNSTREAM,
        )
    }

    fn accept_tcp(&mut self, idx: usize) {
        loop {
            let (stream, peer, port) = {
                let server = &self.servers[idx];
                match server.listener.accept() {
                    Ok((stream, peer)) => (stream, peer, server.port),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        return;
                    }
                }
            };
            let SocketAddr::V4(peer) = peer else {
                continue;
            };
            // the virtual address is the peer's daemon endpoint, not the
            // ephemeral port of its dialling socket
            let vaddr = SocketAddress::Ipv4(std::net::SocketAddrV4::new(*peer.ip(), port));
            if self.clients.contains_key(&vaddr) {
                debug!(address = %vaddr, "duplicate inbound connection dropped");
                continue;
            }
            let _ = sockets::set_user_timeout(stream.as_raw_fd(), self.config.socket_timeout);
            self.install(Stream::Tcp(stream), vaddr, ConnState::Started);
        }
    }

    fn accept_unix(&mut self) {
        loop {
            let accepted = {
                let Some((listener, _, path)) = self.unix_listener.as_ref() else {
                    return;
                };
                match listener.accept() {
                    Ok((stream, _)) => Some((stream, path.display().to_string())),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        warn!(%err, "accept on control socket failed");
                        return;
                    }
                }
            };
            let Some((stream, path)) = accepted else {
                return;
            };
            let token_hint = self.next_token;
            let vaddr = SocketAddress::Local(format!("{path}#{token_hint}"));
            self.install(Stream::Unix(stream), vaddr, ConnState::Started);
        }
    }

    fn install(&mut self, stream: Stream, vaddr: SocketAddress, state: ConnState) -> Token {
        let token = self.next_token();
        let mut link = self.new_link();
        link.set_peer(Some(vaddr.clone()));
        let mut conn = Connection::new(stream, token, vaddr.clone(), link, state);
        conn.stream.register(
            self.poll.registry(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        );
        self.conns.insert(token, conn);
        self.clients.insert(vaddr.clone(), token);
        if self.sched.end_reached() {
            self.sched.reset(&self.clients);
        }
        trace!(address = %vaddr, "connection installed");
        self.fire_event(SocketEventKind::ClientAdded, vaddr);
        token
    }

    fn find_or_create_client(&mut self, addr: &SocketAddress) -> io::Result<Token> {
        if let Some(token) = self.clients.get(addr) {
            return Ok(*token);
        }
        match addr {
            SocketAddress::Ipv4(dest) => {
                let source_ip = self
                    .servers
                    .iter()
                    .find(|s| s.contains(*dest.ip()))
                    .map(|s| s.net.addr());
                let stream = sockets::connect_bound(source_ip, *dest)?;
                let _ = sockets::set_user_timeout(stream.as_raw_fd(), self.config.socket_timeout);
                Ok(self.install(Stream::Tcp(stream), addr.clone(), ConnState::Starting))
            }
            SocketAddress::Local(path) => {
                let stream = mio::net::UnixStream::connect(path)?;
                Ok(self.install(Stream::Unix(stream), addr.clone(), ConnState::Starting))
            }
            SocketAddress::Ipv6(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the overlay runs over ipv4",
            )),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(k) => self.process_kernel(k),
            Command::Forward(fk) => self.process_forward(fk),
            Command::AddServer { net, port, ack } => {
                let result = self.add_server(net, port);
                if let Some(ack) = ack {
                    let _ = ack.send(result.map_err(|e| e.to_string()));
                }
            }
            Command::RemoveServer(net) => self.remove_server(net),
            Command::AddClient { address, resources } => {
                match self.find_or_create_client(&address) {
                    Ok(token) => {
                        if let Some(conn) = self.conns.get_mut(&token) {
                            conn.weight = resources.nodes().max(1);
                        }
                    }
                    Err(err) => warn!(%address, %err, "failed to add client"),
                }
            }
            Command::StopClient(address) => {
                if let Some(token) = self.clients.get(&address).copied() {
                    self.close(token, false);
                }
            }
            Command::SetClientWeight(address, weight) => {
                if let Some(token) = self.clients.get(&address) {
                    if let Some(conn) = self.conns.get_mut(token) {
                        conn.weight = weight.max(1);
                        trace!(%address, weight, "client weight updated");
                    }
                }
            }
            Command::DropApplications(ids) => {
                for conn in self.conns.values_mut() {
                    conn.link.purge_applications(&ids);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => self.running = false,
        }
    }

    fn add_server(&mut self, net: Ipv4Net, port: u16) -> io::Result<()> {
        if self.servers.iter().any(|s| s.net == net) {
            return Ok(());
        }
        let token = self.next_token();
        let mut server = Server::bind(net, port, token)?;
        self.poll
            .registry()
            .register(&mut server.listener, token, Interest::READABLE)?;
        info!(name = self.config.name, address = %server.address(), "server added");
        if self.servers.is_empty() {
            // the fabric-wide generator adopts the first server's range
            let (rank, count) = crate::server::subnet_rank(net);
            let (lo, hi) = kernel::IdGenerator::range_for(rank, count);
            self.env.ids.set_range(lo, hi);
        }
        let address = SocketAddress::Ipv4(server.address());
        self.servers.push(server);
        self.fire_event(SocketEventKind::ServerAdded, address);
        Ok(())
    }

    fn remove_server(&mut self, net: Ipv4Net) {
        if let Some(idx) = self.servers.iter().position(|s| s.net == net) {
            let mut server = self.servers.remove(idx);
            let _ = self.poll.registry().deregister(&mut server.listener);
            let address = SocketAddress::Ipv4(server.address());
            info!(name = self.config.name, %address, "server removed");
            self.fire_event(SocketEventKind::ServerRemoved, address);
        }
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            name: self.config.name.to_string(),
            connections: self
                .conns
                .values()
                .map(|conn| ConnectionSnapshot {
                    address: conn.address.clone(),
                    state: conn.state.name(),
                    weight: conn.weight,
                    upstream: conn.link.upstream_entries(),
                    downstream: conn.link.downstream_entries(),
                })
                .collect(),
        }
    }

    /// Routing decision for a kernel taken off the queue.
    fn process_kernel(&mut self, mut k: KernelPtr) {
        if k.core().moves_everywhere() {
            self.broadcast(&k);
            return;
        }
        if k.core().moves_upstream() && k.core().destination().is_none() {
            self.schedule_upstream(k);
            return;
        }
        if k.core().moves_downstream()
            && k.core().source().is_none()
            && k.core().destination().is_none()
        {
            // originally short-circuited here because no peer was
            // available; it belongs to the local pipeline
            self.env.native.send(k);
            return;
        }
        if k.core().destination().is_none() {
            let source = k.core().source().cloned();
            k.core_mut().set_destination(source);
        }
        let Some(dest) = k.core().destination().cloned() else {
            warn!(id = k.core().id(), "kernel with no route dropped");
            return;
        };
        if k.core().moves_somewhere() {
            self.ensure_identity(&mut k, &dest);
        }
        match self.find_or_create_client(&dest) {
            Ok(token) => self.send_on(token, k),
            Err(err) => {
                warn!(%dest, %err, "no route to destination");
                let core = k.core_mut();
                core.set_source(Some(dest));
                core.set_destination(None);
                core.return_to_parent(ReturnCode::NoUpstreamServers);
                self.env.native.send(k);
            }
        }
    }

    fn send_on(&mut self, token: Token, k: KernelPtr) {
        if let Some(conn) = self.conns.get_mut(&token) {
            {
                let Connection { link, out, .. } = &mut *conn;
                link.send(k, out);
            }
            let _ = conn.flush(self.poll.registry());
        }
    }

    fn broadcast(&mut self, k: &KernelPtr) {
        let mut packet = BytesMut::new();
        let at = begin_packet(&mut packet);
        encode_kernel(k.as_ref(), &mut packet, false);
        end_packet(&mut packet, at);
        let tokens: Vec<Token> = self.clients.values().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                if conn.address.is_local() {
                    continue;
                }
                conn.out.extend_from_slice(&packet);
                let _ = conn.flush(self.poll.registry());
            }
        }
        trace!(id = k.core().id(), "broadcast fanned out");
    }

    /// Upstream kernel with no destination: weighted round-robin over
    /// the peers, optionally short-circuiting to the local node.
    fn schedule_upstream(&mut self, mut k: KernelPtr) {
        let carries = k.core().carries_parent();
        let target: Option<SocketAddress> = if self.config.use_localhost && !carries {
            if self.sched.end_reached() {
                // the local node's turn in the rotation
                self.env.native.send(k);
                self.advance();
                return;
            }
            self.sched.current().cloned()
        } else if self.clients.is_empty() {
            k.core_mut().return_to_parent(ReturnCode::NoUpstreamServers);
            self.env.native.send(k);
            return;
        } else {
            if self.sched.end_reached() {
                self.sched.reset(&self.clients);
            }
            self.sched.current().cloned()
        };
        match target.and_then(|a| self.clients.get(&a).copied()) {
            Some(token) => {
                let dest = self
                    .conns
                    .get(&token)
                    .map(|c| c.address.clone())
                    .unwrap_or(SocketAddress::Local(String::new()));
                self.ensure_identity(&mut k, &dest);
                self.send_on(token, k);
            }
            None => {
                k.core_mut().return_to_parent(ReturnCode::NoUpstreamServers);
                self.env.native.send(k);
            }
        }
        self.advance();
    }

    fn advance(&mut self) {
        let use_localhost = self.config.use_localhost;
        let Self {
            sched,
            conns,
            clients,
            ..
        } = self;
        sched.advance(
            clients,
            |a| {
                clients.get(a).and_then(|t| conns.get(t)).map(|c| Candidate {
                    weight: c.weight,
                    started: c.is_started(),
                })
            },
            use_localhost,
        );
    }

    /// Foreign kernels forwarded between daemons on behalf of worker
    /// applications.
    fn process_forward(&mut self, fk: Box<ForeignKernel>) {
        if let Some(dest) = fk.core().destination().cloned() {
            match self.find_or_create_client(&dest) {
                Ok(token) => self.forward_on(token, fk),
                Err(err) => warn!(%dest, %err, "dropping unroutable foreign kernel"),
            }
            return;
        }
        if self.sched.end_reached() && fk.core().moves_upstream() && fk.carries_parent() {
            self.advance();
            if self.sched.end_reached() {
                debug!(id = fk.core().id(), "foreign kernel carrying parent stays local");
            }
        }
        if self.sched.end_reached() {
            self.advance();
            self.env.foreign.forward_foreign(fk);
        } else {
            let target = self
                .sched
                .current()
                .and_then(|a| self.clients.get(a).copied());
            match target {
                Some(token) => {
                    self.forward_on(token, fk);
                    self.advance();
                }
                None => self.env.foreign.forward_foreign(fk),
            }
        }
    }

    fn forward_on(&mut self, token: Token, fk: Box<ForeignKernel>) {
        if let Some(conn) = self.conns.get_mut(&token) {
            {
                let Connection { link, out, .. } = &mut *conn;
                link.forward(fk, out);
            }
            let _ = conn.flush(self.poll.registry());
        }
    }

    /// Assign IDs to the kernel (and its parent) so the reply can be
    /// correlated. The fabric generator was narrowed to this node's
    /// subnet-rank range when the first server was bound.
    fn ensure_identity(&mut self, k: &mut KernelPtr, _dest: &SocketAddress) {
        let core = k.core_mut();
        core.ensure_id(&self.env.ids);
        if let ParentLink::Owned(parent) = core.parent_mut() {
            parent.core_mut().ensure_id(&self.env.ids);
        }
    }

    /// Post a socket event kernel to every resident instance.
    fn fire_event(&self, kind: SocketEventKind, address: SocketAddress) {
        for (_, inst) in self.env.instances.snapshot() {
            let resident = inst.lock().core().is_resident();
            if !resident {
                continue;
            }
            let mut ev = Box::new(SocketEvent::new(kind, address.clone()));
            ev.core_mut().set_phase(kernel::Phase::PointToPoint);
            ev.core_mut()
                .set_principal(Principal::Instance(inst.clone()));
            self.env.native.send(ev);
        }
    }

    /// Connections stuck in `starting` longer than the socket timeout
    /// are failed; their kernels are recovered as on error.
    fn expire_starting(&mut self) {
        let expired: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| {
                c.state == ConnState::Starting && c.opened_at.elapsed() > self.config.socket_timeout
            })
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            debug!("connection timed out while starting");
            self.close(token, true);
        }
    }
}
