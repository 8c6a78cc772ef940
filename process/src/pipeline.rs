// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The child-process pipeline event loop, its reaper thread and its
//! cross-thread handle.

use crate::application::{Application, ChildPipes};
use crate::event::ProcessEvent;
use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use kernel::codec::encode_kernel;
use kernel::frame::{begin_packet, end_packet};
use kernel::{
    ConnectionSnapshot, ForeignKernel, Kernel, KernelPtr, Link, LinkEnv, LinkFlags, Phase,
    Pipeline, PipelineSnapshot, Principal, ReturnCode, SocketAddress,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const WAKER: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const REAP_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: &'static str,
    pub this_application: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: "lat-process",
            this_application: 0,
        }
    }
}

enum Command {
    Send(KernelPtr),
    Forward(Box<ForeignKernel>),
    Add(Application, Option<Sender<Result<u64, String>>>),
    Terminate(Vec<u64>),
    Jobs(Sender<Vec<Application>>),
    Snapshot(Sender<PipelineSnapshot>),
    ChildExited(u64, i32),
    Shutdown,
}

type ChildTable = Arc<Mutex<HashMap<u64, Child>>>;

/// Cross-thread handle to the child-process pipeline.
pub struct ProcessPipelineHandle {
    name: &'static str,
    cmd: Sender<Command>,
    waker: Arc<Waker>,
    stop_reaper: Arc<AtomicBool>,
    join: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPipelineHandle {
    fn post(&self, cmd: Command) {
        if self.cmd.send(cmd).is_err() {
            debug!(name = self.name, "process pipeline is gone");
            return;
        }
        let _ = self.waker.wake();
    }

    /// Spawn a worker for `app`; returns its application ID.
    pub fn add_application(&self, app: Application) -> Result<u64, String> {
        let (ack, ack_rx) = bounded(1);
        self.post(Command::Add(app, Some(ack)));
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| "process pipeline did not answer".to_string())?
    }

    /// Kill the listed applications and drop their queued kernels.
    pub fn terminate(&self, ids: Vec<u64>) {
        self.post(Command::Terminate(ids));
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<Application> {
        let (tx, rx) = bounded(1);
        self.post(Command::Jobs(tx));
        rx.recv_timeout(Duration::from_secs(1)).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<PipelineSnapshot> {
        let (tx, rx) = bounded(1);
        self.post(Command::Snapshot(tx));
        rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    pub fn stop(&self) {
        self.stop_reaper.store(true, Ordering::SeqCst);
        self.post(Command::Shutdown);
        let mut join = self.join.lock();
        for handle in join.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Pipeline for ProcessPipelineHandle {
    fn send(&self, k: KernelPtr) {
        self.post(Command::Send(k));
    }

    fn forward_foreign(&self, fk: Box<ForeignKernel>) {
        self.post(Command::Forward(fk));
    }

    fn drop_application(&self, ids: &[u64]) {
        self.post(Command::Terminate(ids.to_vec()));
    }
}

/// The unstarted pipeline: owns the poller until `start` moves it onto
/// the I/O thread.
pub struct ProcessPipeline {
    config: ProcessConfig,
    poll: Poll,
    rx: Receiver<Command>,
    handle: Arc<ProcessPipelineHandle>,
}

impl ProcessPipeline {
    pub fn create(config: ProcessConfig) -> io::Result<(Self, Arc<ProcessPipelineHandle>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = unbounded();
        let handle = Arc::new(ProcessPipelineHandle {
            name: config.name,
            cmd: tx,
            waker,
            stop_reaper: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(Vec::new()),
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

    pub fn start(self, env: LinkEnv) {
        let name = self.config.name;
        let handle = self.handle.clone();
        let children: ChildTable = Arc::new(Mutex::new(HashMap::new()));

        let reaper_children = children.clone();
        let reaper_cmd = handle.cmd.clone();
        let reaper_waker = handle.waker.clone();
        let stop_reaper = handle.stop_reaper.clone();
        let reaper = std::thread::Builder::new()
            .name(format!("{name}-reaper"))
            .spawn(move || {
                reap(&reaper_children, &reaper_cmd, &reaper_waker, &stop_reaper);
            })
            .expect("failed to spawn reaper thread");

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut lp = Loop::new(self.config, self.poll, self.rx, env, children);
                lp.run();
            })
            .expect("failed to spawn process pipeline thread");

        let mut join = handle.join.lock();
        join.push(thread);
        join.push(reaper);
    }
}

/// Wait for children to exit and report them to the loop.
fn reap(
    children: &ChildTable,
    cmd: &Sender<Command>,
    waker: &Arc<Waker>,
    stop: &Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(REAP_INTERVAL);
        let mut exited = Vec::new();
        {
            let mut table = children.lock();
            let ids: Vec<u64> = table.keys().copied().collect();
            for id in ids {
                if let Some(child) = table.get_mut(&id) {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            exited.push((id, status.code().unwrap_or(-1)));
                            table.remove(&id);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(application = id, %err, "wait failed");
                            table.remove(&id);
                            exited.push((id, -1));
                        }
                    }
                }
            }
        }
        for (id, code) in exited {
            if cmd.send(Command::ChildExited(id, code)).is_ok() {
                let _ = waker.wake();
            }
        }
    }
}

struct ChildHandler {
    app: Application,
    link: Link,
    pipes: ChildPipes,
    out: BytesMut,
    inbuf: BytesMut,
    token_r: Token,
    token_w: Token,
    write_registered: bool,
    eof: bool,
}

enum FillOutcome {
    Open,
    Closed,
}

impl ChildHandler {
    fn fill(&mut self) -> io::Result<FillOutcome> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match nix::unistd::read(&self.pipes.from_child, &mut chunk) {
                Ok(0) => return Ok(FillOutcome::Closed),
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => return Ok(FillOutcome::Open),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(io::Error::from(err)),
            }
        }
    }

    fn flush(&mut self, registry: &mio::Registry) {
        while !self.out.is_empty() {
            match nix::unistd::write(&self.pipes.to_child, &self.out) {
                Ok(0) => break,
                Ok(n) => self.out.advance(n),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => {}
                Err(err) => {
                    warn!(application = self.app.id, %err, "pipe write failed");
                    break;
                }
            }
        }
        let want = !self.out.is_empty();
        let raw = self.pipes.to_child.as_raw_fd();
        if want && !self.write_registered {
            let _ = registry.register(&mut SourceFd(&raw), self.token_w, Interest::WRITABLE);
            self.write_registered = true;
        } else if !want && self.write_registered {
            let _ = registry.deregister(&mut SourceFd(&raw));
            self.write_registered = false;
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) {
        let raw_r = self.pipes.from_child.as_raw_fd();
        let _ = registry.deregister(&mut SourceFd(&raw_r));
        if self.write_registered {
            let raw_w = self.pipes.to_child.as_raw_fd();
            let _ = registry.deregister(&mut SourceFd(&raw_w));
            self.write_registered = false;
        }
    }
}

struct Loop {
    config: ProcessConfig,
    poll: Poll,
    rx: Receiver<Command>,
    env: LinkEnv,
    children: ChildTable,
    handlers: HashMap<u64, ChildHandler>,
    tokens: HashMap<Token, u64>,
    next_token: usize,
    running: bool,
}

impl Loop {
    fn new(
        config: ProcessConfig,
        poll: Poll,
        rx: Receiver<Command>,
        env: LinkEnv,
        children: ChildTable,
    ) -> Self {
        Self {
            config,
            poll,
            rx,
            env,
            children,
            handlers: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            running: true,
        }
    }

    fn run(&mut self) {
        info!(name = self.config.name, "process pipeline running");
        let mut events = Events::with_capacity(64);
        while self.running {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(name = self.config.name, %err, "poll failed");
                break;
            }
            let fired: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in fired {
                self.handle_event(token, readable, writable);
            }
            while let Ok(cmd) = self.rx.try_recv() {
                self.handle_command(cmd);
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        let ids: Vec<u64> = self.handlers.keys().copied().collect();
        for id in ids {
            if let Some(mut handler) = self.handlers.remove(&id) {
                handler.deregister(self.poll.registry());
            }
        }
        let mut table = self.children.lock();
        for (id, mut child) in table.drain() {
            debug!(application = id, "killing worker at shutdown");
            let _ = child.kill();
            let _ = child.wait();
        }
        info!(name = self.config.name, "process pipeline stopped");
    }

    fn handle_event(&mut self, token: Token, readable: bool, writable: bool) {
        if token == WAKER {
            return;
        }
        let Some(app_id) = self.tokens.get(&token).copied() else {
            return;
        };
        let Some(handler) = self.handlers.get_mut(&app_id) else {
            return;
        };
        if writable && token == handler.token_w {
            handler.flush(self.poll.registry());
        }
        if readable && token == handler.token_r && !handler.eof {
            match handler.fill() {
                Ok(FillOutcome::Open) => {
                    {
                        let ChildHandler {
                            link, inbuf, out, ..
                        } = &mut *handler;
                        if let Err(err) = link.receive(inbuf, out) {
                            warn!(application = app_id, %err, "bad kernel stream from worker");
                        }
                    }
                    handler.flush(self.poll.registry());
                }
                Ok(FillOutcome::Closed) => {
                    // the exit itself is observed by the reaper
                    trace!(application = app_id, "worker closed its pipe");
                    handler.eof = true;
                    let raw = handler.pipes.from_child.as_raw_fd();
                    let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
                }
                Err(err) => {
                    warn!(application = app_id, %err, "pipe read failed");
                    handler.eof = true;
                    let raw = handler.pipes.from_child.as_raw_fd();
                    let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(k) => self.process_kernel(k),
            Command::Forward(fk) => self.process_forward(fk),
            Command::Add(app, ack) => {
                let result = self.add(app);
                if let Some(ack) = ack {
                    let _ = ack.send(result.map_err(|e| e.to_string()));
                }
            }
            Command::Terminate(ids) => self.terminate(&ids),
            Command::Jobs(reply) => {
                let jobs = self.handlers.values().map(|h| h.app.clone()).collect();
                let _ = reply.send(jobs);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ChildExited(id, code) => self.on_child_exit(id, code),
            Command::Shutdown => self.running = false,
        }
    }

    fn add(&mut self, app: Application) -> io::Result<u64> {
        if self.handlers.contains_key(&app.id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "duplicate application id",
            ));
        }
        let (child, pipes) = app.execute()?;
        let id = app.id;
        info!(
            application = id,
            pid = child.id(),
            uid = app.uid,
            gid = app.gid,
            command = %app.argv.join(" "),
            "worker spawned"
        );
        let token_r = Token(self.next_token);
        let token_w = Token(self.next_token + 1);
        self.next_token += 2;
        let mut link = Link::new(
            self.env.clone(),
            self.config.this_application,
            LinkFlags::SAVE_UPSTREAM
                | LinkFlags::SAVE_DOWNSTREAM
                | LinkFlags::PREPEND_SOURCE_AND_DESTINATION,
        );
        link.set_peer(Some(SocketAddress::Local(format!("app-{id}"))));
        link.set_from_application(Some(id));
        let raw_r = pipes.from_child.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&raw_r), token_r, Interest::READABLE)?;
        self.tokens.insert(token_r, id);
        self.tokens.insert(token_w, id);
        self.children.lock().insert(id, child);
        self.handlers.insert(
            id,
            ChildHandler {
                app,
                link,
                pipes,
                out: BytesMut::new(),
                inbuf: BytesMut::new(),
                token_r,
                token_w,
                write_registered: false,
                eof: false,
            },
        );
        Ok(id)
    }

    fn terminate(&mut self, ids: &[u64]) {
        for id in ids {
            if let Some(mut child) = self.children.lock().remove(id) {
                debug!(application = id, "terminating worker");
                let _ = child.kill();
                let _ = child.wait();
            }
            if let Some(mut handler) = self.handlers.remove(id) {
                handler.deregister(self.poll.registry());
                self.tokens.remove(&handler.token_r);
                self.tokens.remove(&handler.token_w);
            }
        }
        for handler in self.handlers.values_mut() {
            handler.link.purge_applications(ids);
        }
    }

    fn on_child_exit(&mut self, id: u64, code: i32) {
        info!(application = id, code, "worker exited");
        if let Some(mut handler) = self.handlers.remove(&id) {
            handler.deregister(self.poll.registry());
            self.tokens.remove(&handler.token_r);
            self.tokens.remove(&handler.token_w);
            // the pipe died with the process: error-close semantics
            handler.link.recover(true);
        }
        for (_, inst) in self.env.instances.snapshot() {
            let resident = inst.lock().core().is_resident();
            if !resident {
                continue;
            }
            let mut ev = Box::new(ProcessEvent::terminated(id, code));
            ev.core_mut().set_phase(Phase::PointToPoint);
            ev.core_mut().set_principal(Principal::Instance(inst.clone()));
            self.env.native.send(ev);
        }
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            name: self.config.name.to_string(),
            connections: self
                .handlers
                .values()
                .map(|h| ConnectionSnapshot {
                    address: SocketAddress::Local(format!("app-{}", h.app.id)),
                    state: if h.eof { "stopping" } else { "started" },
                    weight: 1,
                    upstream: h.link.upstream_entries(),
                    downstream: h.link.downstream_entries(),
                })
                .collect(),
        }
    }

    fn process_kernel(&mut self, mut k: KernelPtr) {
        if k.core().moves_everywhere() {
            let mut packet = BytesMut::new();
            let at = begin_packet(&mut packet);
            encode_kernel(k.as_ref(), &mut packet, true);
            end_packet(&mut packet, at);
            for handler in self.handlers.values_mut() {
                handler.out.extend_from_slice(&packet);
                handler.flush(self.poll.registry());
            }
            return;
        }
        let app = k.core().target_application();
        match self.handlers.get_mut(&app) {
            Some(handler) => {
                {
                    let ChildHandler { link, out, .. } = &mut *handler;
                    link.send(k, out);
                }
                handler.flush(self.poll.registry());
            }
            None => {
                warn!(application = app, "no such application");
                k.core_mut().return_to_parent(ReturnCode::Error);
                self.env.native.send(k);
            }
        }
    }

    fn process_forward(&mut self, fk: Box<ForeignKernel>) {
        let app = fk.core().target_application();
        match self.handlers.get_mut(&app) {
            Some(handler) => {
                {
                    let ChildHandler { link, out, .. } = &mut *handler;
                    link.forward(fk, out);
                }
                handler.flush(self.poll.registry());
            }
            None => warn!(application = app, "dropping kernel for unknown application"),
        }
    }
}
