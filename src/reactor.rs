//! The event loop: readiness multiplexing, endpoint registry, coroutine
//! scheduling and the handler-callback dispatch order described in the
//! crate-level docs.
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::net::{self, SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_channel as chan;
use log::{debug, error, trace, warn};
use socket2::{Domain, Socket, Type};

use crate::command::{Command, Handle};
use crate::coroutine::{panic_message, Coroutine, Job};
use crate::endpoint::{Endpoint, EndpointId, Io, State};
use crate::error::Error;
use crate::facade::{Context, Request, Resume, Target};
use crate::handler::{Handler, Tag};
use crate::time::{LocalDuration, LocalTime, TimeoutManager, TimerHandle};

/// Tunables for a [`Reactor`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen backlog passed to the platform when binding a listener.
    pub backlog: i32,
    /// Size of the scratch buffer used to read an endpoint's socket or file
    /// into before handing the bytes to its coroutine.
    pub read_buffer_size: usize,
    /// Upper bound on how long a single `poll` call may block, even with no
    /// timers scheduled; keeps the loop responsive to `Handle` commands sent
    /// right before the waker's write lands.
    pub max_poll_timeout: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: 10,
            read_buffer_size: 192 * 1024,
            max_poll_timeout: LocalDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceKey {
    Endpoint(EndpointId),
    Waker,
}

/// What a fired timer means to the reactor: either the deadline of a
/// pending non-blocking connect, or an opaque user timer.
enum TimerKind<T> {
    Connect(EndpointId),
    User(T),
}

fn open_options_for(mode: &str) -> Result<OpenOptions, Error> {
    let mut opts = OpenOptions::new();
    match mode {
        "r" => {
            opts.read(true);
        }
        "w" => {
            opts.write(true).create(true).truncate(true);
        }
        "a" => {
            opts.append(true).create(true);
        }
        "r+" => {
            opts.read(true).write(true);
        }
        "w+" => {
            opts.read(true).write(true).create(true).truncate(true);
        }
        other => {
            return Err(Error::NotFound(format!("unsupported file mode {:?}", other)));
        }
    }
    Ok(opts)
}

/// Begin a non-blocking TCP connect. Returns a stream that may still be
/// `Connecting` (not yet writable) rather than blocking until it completes,
/// unlike `TcpStream::connect`.
fn connect_nonblocking(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;

    let connected = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        // POSIX `connect(2)` on a non-blocking socket returns `EINPROGRESS`,
        // which the standard library also surfaces as `WouldBlock`, but some
        // platforms have been seen to return it as a raw OS error instead.
        Err(e) if e.raw_os_error() == Some(libc_eniprogress()) => false,
        Err(e) => return Err(e),
    };

    Ok((socket.into(), connected))
}

// `socket2` doesn't re-export `libc`; `EINPROGRESS` is 115 on Linux and 36 on
// the BSDs/macOS. Matching on `ErrorKind::WouldBlock` above covers every
// platform `std` runs on in practice; this is a narrow defensive fallback.
#[cfg(target_os = "linux")]
fn libc_eniprogress() -> i32 {
    115
}
#[cfg(not(target_os = "linux"))]
fn libc_eniprogress() -> i32 {
    36
}

/// Endpoint registry, timers, queued user events and the `popol` source set
/// — everything a [`Context`] needs to serve a callback, independent of the
/// handler itself.
pub(crate) struct ReactorState<T: Tag> {
    endpoints: HashMap<EndpointId, Endpoint<T>>,
    tags: HashMap<T, EndpointId>,
    timers: TimeoutManager<TimerKind<T>>,
    user_events: VecDeque<Box<dyn Any + Send>>,
    sources: popol::Sources<SourceKey>,
    next_id: EndpointId,
    stopped: bool,
    config: Config,
}

impl<T: Tag> ReactorState<T> {
    fn new(sources: popol::Sources<SourceKey>, config: Config) -> Self {
        Self {
            endpoints: HashMap::new(),
            tags: HashMap::new(),
            timers: TimeoutManager::new(),
            user_events: VecDeque::new(),
            sources,
            next_id: 0,
            stopped: false,
            config,
        }
    }

    fn alloc_id(&mut self) -> EndpointId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn resolve(&self, current: Option<EndpointId>, target: &Target<T>) -> Option<EndpointId> {
        match target {
            Target::Current => current,
            Target::Tag(tag) => self.tags.get(tag).copied(),
        }
    }

    /// Open a file and register it as a seekable endpoint.
    fn open(&mut self, path: &Path, mode: &str, tag: T, use_error_handler: bool) -> Result<EndpointId, Error> {
        let file = open_options_for(mode)?.open(path)?;
        let id = self.alloc_id();

        self.sources.register(SourceKey::Endpoint(id), &file, popol::interest::ALL);

        let ep = Endpoint::new(Io::File(file), Some(tag.clone()), State::Connected, true, use_error_handler);
        self.tags.insert(tag, id);
        self.endpoints.insert(id, ep);

        Ok(id)
    }

    /// Bind and register a listening socket with the configured backlog.
    /// Returns the bound local address, useful when `addr`'s port is `0`.
    fn listen(&mut self, addr: SocketAddr, tag: T) -> Result<SocketAddr, Error> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;
        socket.set_nonblocking(true)?;
        let listener: net::TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let id = self.alloc_id();
        self.sources.register(SourceKey::Endpoint(id), &listener, popol::interest::READ);

        let ep = Endpoint::new(Io::Listener(listener), Some(tag.clone()), State::Listening, false, true);
        self.tags.insert(tag, id);
        self.endpoints.insert(id, ep);

        Ok(local_addr)
    }

    /// Begin a non-blocking connect and register it. A connect timeout, if
    /// given, is armed only while the socket is still `Connecting`.
    fn connect(
        &mut self,
        addr: SocketAddr,
        tag: T,
        timeout: Option<LocalDuration>,
        now: LocalTime,
    ) -> Result<(EndpointId, bool), Error> {
        let (stream, connected) = connect_nonblocking(addr)?;
        let id = self.alloc_id();

        self.sources.register(SourceKey::Endpoint(id), &stream, popol::interest::ALL);

        let state = if connected { State::Connected } else { State::Connecting };
        let mut ep = Endpoint::new(Io::Stream(stream), Some(tag.clone()), state, false, true);

        if !connected {
            if let Some(duration) = timeout {
                ep.connect_timer = Some(self.timers.add(duration, TimerKind::Connect(id), false, false, now));
            }
        }

        self.tags.insert(tag, id);
        self.endpoints.insert(id, ep);

        Ok((id, connected))
    }

    /// Tear down an endpoint: cancel its connect timer, shut down its
    /// coroutine (if one is still parked), flush whatever output it has
    /// left, and drop it from every index. Idempotent.
    fn dispose(&mut self, id: EndpointId) {
        let Some(mut ep) = self.endpoints.remove(&id) else {
            return;
        };

        if let Some(tag) = ep.tag.take() {
            debug!("{:?}: disconnecting", tag);
            self.tags.remove(&tag);
        }
        self.sources.unregister(&SourceKey::Endpoint(id));

        if let Some(timer) = ep.connect_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(coroutine) = ep.coroutine.take() {
            if coroutine.alive {
                coroutine.shutdown();
            }
        }
        if let Err(err) = ep.output.flush(&mut ep.io) {
            warn!("final flush on dispose failed: {}", err);
        }
    }

    /// Apply one request from a channel- or direct-backed [`Context`]
    /// against this endpoint state. `current` is the id of the endpoint the
    /// calling callback is scoped to, or `None` for `user_event`.
    pub(crate) fn apply(&mut self, current: Option<EndpointId>, request: Request<T>) -> Resume<T> {
        let now = SystemTime::now();

        match request {
            Request::Need(_) | Request::Done | Request::Panicked(_) => {
                unreachable!("Need/Done/Panicked are resolved by the coroutine pump, never by apply")
            }
            Request::Write(target, bytes) => {
                if let Some(id) = self.resolve(current, &target) {
                    if let Some(ep) = self.endpoints.get_mut(&id) {
                        let offset = ep.write_offset;
                        ep.output.append(offset, &bytes);
                        ep.write_offset += bytes.len() as u64;
                    }
                }
                Resume::Ack
            }
            Request::Seek(target, pos) => {
                if let Some(id) = self.resolve(current, &target) {
                    if let Some(ep) = self.endpoints.get_mut(&id) {
                        if ep.seekable {
                            ep.write_offset = apply_seek(ep.write_offset, pos);
                        }
                    }
                }
                Resume::Ack
            }
            Request::Close(Target::Current) => {
                if let Some(id) = current {
                    if let Some(ep) = self.endpoints.get_mut(&id) {
                        ep.closing = true;
                    }
                }
                Resume::Ack
            }
            Request::Close(Target::Tag(tag)) => {
                if let Some(id) = self.tags.get(&tag).copied() {
                    self.dispose(id);
                }
                Resume::Ack
            }
            Request::CurrentTag => {
                let tag = current.and_then(|id| self.endpoints.get(&id)).and_then(|e| e.tag.clone());
                Resume::Tag(tag)
            }
            Request::FindByTag(tag) => Resume::Found(self.tags.contains_key(&tag)),
            Request::SetMetaInfo(new_tag) => {
                if let Some(id) = current {
                    if let Some(ep) = self.endpoints.get_mut(&id) {
                        if let Some(old) = ep.tag.take() {
                            self.tags.remove(&old);
                        }
                        ep.tag = Some(new_tag.clone());
                        self.tags.insert(new_tag, id);
                    }
                }
                Resume::Ack
            }
            Request::ScheduleTimer {
                duration,
                tag,
                recurring,
                immediate,
            } => {
                let handle = self.timers.add(duration, TimerKind::User(tag), recurring, immediate, now);
                Resume::Timer(handle)
            }
            Request::CancelTimer(handle) => {
                self.timers.cancel(handle);
                Resume::Ack
            }
            Request::AddUserEvent(event) => {
                self.user_events.push_back(event);
                Resume::Ack
            }
        }
    }
}

fn apply_seek(current_offset: u64, pos: io::SeekFrom) -> u64 {
    match pos {
        io::SeekFrom::Start(n) => n,
        io::SeekFrom::Current(n) => (current_offset as i64 + n).max(0) as u64,
        // The real end-of-file position isn't tracked virtually; `SeekFrom::End`
        // leaves the cursor where it was rather than guessing at a length.
        io::SeekFrom::End(_) => current_offset,
    }
}

/// Drives a single [`Handler`] over a `popol`-based readiness loop on
/// whichever thread calls [`Reactor::start`]. Every other operation —
/// connecting, listening, opening a file, scheduling timers, stopping —
/// can be called from that same thread before `start`, or from any thread
/// at any time through a [`Handle`].
pub struct Reactor<H: Handler> {
    handler: Arc<Mutex<H>>,
    state: ReactorState<H::Tag>,
    waker: Arc<popol::Waker>,
    commands_tx: chan::Sender<Command>,
    commands_rx: chan::Receiver<Command>,
    /// Set by `invoke_error` when an endpoint errors with `use_error_handler`
    /// false: there is no handler willing to receive it, so it is queued
    /// here and re-raised out of `start()` to whoever is running the
    /// reactor instead of being dropped silently. The first such error in a
    /// pass wins; later ones in the same pass are logged and swallowed.
    fatal: Option<Error>,
}

impl<H: Handler + 'static> Reactor<H> {
    /// Create a reactor around `handler`, ready to register endpoints and
    /// be started.
    pub fn new(handler: H, config: Config) -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = Arc::new(popol::Waker::new(&mut sources, SourceKey::Waker)?);
        let (commands_tx, commands_rx) = chan::unbounded();

        Ok(Self {
            handler: Arc::new(Mutex::new(handler)),
            state: ReactorState::new(sources, config),
            waker,
            commands_tx,
            commands_rx,
            fatal: None,
        })
    }

    /// A cloneable, `Send` capability for stopping the reactor or queueing a
    /// user event from a thread other than the one running [`Reactor::start`].
    pub fn handle(&self) -> Handle {
        Handle::new(self.commands_tx.clone(), self.waker.clone())
    }

    /// Begin a non-blocking outbound connect. If it completes immediately
    /// (loopback connects routinely do), `client_init` runs before this
    /// call returns; otherwise it runs once the socket becomes writable.
    pub fn connect(&mut self, addr: SocketAddr, tag: H::Tag, timeout: Option<LocalDuration>) -> Result<(), Error> {
        let now = SystemTime::now();
        let (id, connected) = self.state.connect(addr, tag.clone(), timeout, now)?;
        if connected {
            self.run_coroutine(id, Job::ClientInit(tag));
        }
        Ok(())
    }

    /// Bind and register a listening socket. Returns the bound local
    /// address (useful when `addr`'s port is `0`).
    pub fn listen(&mut self, addr: SocketAddr, tag: H::Tag) -> Result<SocketAddr, Error> {
        self.state.listen(addr, tag)
    }

    /// Open a local file as a seekable endpoint.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: &str, tag: H::Tag, use_error_handler: bool) -> Result<(), Error> {
        self.state.open(path.as_ref(), mode, tag, use_error_handler)?;
        Ok(())
    }

    /// Schedule a timer. Immediate timers fire on the next pass.
    pub fn schedule_timer(&mut self, duration: LocalDuration, tag: H::Tag, recurring: bool, immediate: bool) -> TimerHandle {
        let now = SystemTime::now();
        self.state.timers.add(duration, TimerKind::User(tag), recurring, immediate, now)
    }

    /// Cancel a previously scheduled timer.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.state.timers.cancel(handle);
    }

    /// Queue a user event for delivery on the next pass.
    pub fn add_user_event(&mut self, event: Box<dyn Any + Send>) {
        self.state.user_events.push_back(event);
    }

    /// Request a graceful stop: the loop exits once every endpoint's
    /// pending output has drained.
    pub fn stop(&mut self) {
        self.state.stopped = true;
        self.waker.wake().ok();
    }

    /// Run the reactor until [`Reactor::stop`]/[`Handle::stop`] is called
    /// and all pending output has drained, or an unrecoverable I/O error
    /// occurs polling the source set.
    pub fn start(&mut self) -> Result<(), Error> {
        let mut events = popol::Events::new();
        let mut scratch = vec![0u8; self.state.config.read_buffer_size];

        loop {
            if self.state.stopped && !self.state.endpoints.values().any(Endpoint::wants_write) {
                break;
            }

            self.refresh_interest();

            let now = SystemTime::now();
            while let Some(kind) = self.state.timers.next(now) {
                self.fire_timer(kind);
            }

            while let Some(event) = self.state.user_events.pop_front() {
                self.deliver_user_event(event);
            }

            let timeout = self
                .state
                .timers
                .wait(SystemTime::now())
                .unwrap_or(self.state.config.max_poll_timeout)
                .min(self.state.config.max_poll_timeout);

            trace!(
                "polling {} source(s), waking up in {:?}",
                self.state.sources.len(),
                timeout
            );

            match self.state.sources.wait_timeout(&mut events, timeout) {
                Ok(()) => self.dispatch_readiness(&mut events, &mut scratch),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // A timeout surfaces as an error from `wait_timeout`; the timer
                // drain at the top of the next pass handles whatever is due.
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }

            if let Some(err) = self.fatal.take() {
                // An endpoint with `use_error_handler == false` errored; there's
                // no handler to hand it to, so it propagates to our own caller
                // instead. Every endpoint still gets torn down below before we
                // return, just like a clean `stop()`.
                let ids: Vec<EndpointId> = self.state.endpoints.keys().copied().collect();
                for id in ids {
                    self.state.dispose(id);
                }
                return Err(err);
            }
        }

        let ids: Vec<EndpointId> = self.state.endpoints.keys().copied().collect();
        for id in ids {
            self.state.dispose(id);
        }

        Ok(())
    }

    /// Recompute each endpoint's registered interest from its current state,
    /// per the readiness rules in the crate-level docs.
    fn refresh_interest(&mut self) {
        let stopped = self.state.stopped;
        let wants: Vec<(EndpointId, bool, bool)> = self
            .state
            .endpoints
            .iter()
            .map(|(id, ep)| (*id, ep.wants_read(stopped), ep.wants_write()))
            .collect();

        for (id, read, write) in wants {
            if let Some(source) = self.state.sources.get_mut(&SourceKey::Endpoint(id)) {
                source.unset(popol::interest::ALL);
                if read {
                    source.set(popol::interest::READ);
                }
                if write {
                    source.set(popol::interest::WRITE);
                }
            }
        }
    }

    fn fire_timer(&mut self, kind: TimerKind<H::Tag>) {
        match kind {
            TimerKind::Connect(id) => self.fail_connect_timeout(id),
            TimerKind::User(tag) => {
                debug!("timer fired: {:?}", tag);
                self.run_direct(None, |ctx, handler| handler.timer_expired(ctx, tag));
            }
        }
    }

    fn deliver_user_event(&mut self, event: Box<dyn Any + Send>) {
        self.run_direct(None, move |ctx, handler| handler.user_event(ctx, event));
    }

    /// Run a handler callback directly on the reactor thread against a
    /// borrowed [`Context`], for callbacks that can never suspend. A panic
    /// is caught, logged, and otherwise ignored — per SPEC_FULL.md §4.1/§7,
    /// exceptions raised anywhere inside a loop pass are logged and the
    /// loop continues, it never exits due to a handler error.
    fn run_direct(&mut self, current: Option<EndpointId>, f: impl FnOnce(&mut Context<'_, H::Tag>, &mut H)) {
        let mut ctx = Context::direct(&mut self.state, current);
        // Recovering a poisoned lock (rather than `.expect`ing) means a panic
        // caught below from an *earlier* callback never takes down every
        // other callback that shares this handler.
        let mut handler = self.handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx, &mut handler)));
        if let Err(payload) = outcome {
            error!("handler callback panicked: {}", panic_message(&*payload));
        }
    }

    fn dispatch_readiness(&mut self, events: &mut popol::Events<SourceKey>, scratch: &mut [u8]) {
        trace!("woke up with {} source(s) ready", events.len());

        let mut batch: Vec<(SourceKey, bool, bool, RawFd)> = Vec::new();
        for (key, ev) in events.iter() {
            batch.push((*key, ev.readable || ev.hangup || ev.errored, ev.writable, ev.source));
        }

        for (key, readable, _, fd) in &batch {
            if !readable {
                continue;
            }
            match key {
                SourceKey::Waker => self.drain_waker(*fd),
                SourceKey::Endpoint(id) => self.dispatch_readable(*id, scratch),
            }
        }
        for (key, _, writable, _) in &batch {
            if *writable {
                if let SourceKey::Endpoint(id) = key {
                    self.dispatch_writable(*id);
                }
            }
        }
    }

    fn drain_waker(&mut self, fd: RawFd) {
        popol::Waker::reset(fd).ok();
        for cmd in self.commands_rx.try_iter() {
            match cmd {
                Command::Stop => self.state.stopped = true,
                Command::UserEvent(event) => self.state.user_events.push_back(event),
            }
        }
    }

    fn dispatch_readable(&mut self, id: EndpointId, scratch: &mut [u8]) {
        let is_listener = matches!(self.state.endpoints.get(&id), Some(ep) if matches!(ep.io, Io::Listener(_)));
        if is_listener {
            self.accept_loop(id);
        } else {
            self.service_read(id, scratch);
        }
    }

    fn accept_loop(&mut self, id: EndpointId) {
        let listener_tag = match self.state.endpoints.get(&id).and_then(|e| e.tag.clone()) {
            Some(tag) => tag,
            None => return,
        };

        loop {
            let accepted = {
                let ep = match self.state.endpoints.get(&id) {
                    Some(ep) => ep,
                    None => return,
                };
                let listener = match &ep.io {
                    Io::Listener(l) => l,
                    _ => return,
                };
                listener.accept()
            };

            let (conn, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("accept error: {}", err);
                    return;
                }
            };

            if let Err(err) = conn.set_nonblocking(true) {
                warn!("failed to set accepted socket non-blocking: {}", err);
                continue;
            }
            let port = conn.local_addr().map(|a| a.port()).unwrap_or(0);
            debug!("{:?}: accepted connection from {}", listener_tag, addr);

            let new_id = self.state.alloc_id();
            self.state.sources.register(SourceKey::Endpoint(new_id), &conn, popol::interest::ALL);

            // Untagged until the handler's `server_init` calls `set_meta_info`;
            // it isn't discoverable by tag until then.
            let ep = Endpoint::new(Io::Stream(conn), None, State::Connected, false, true);
            self.state.endpoints.insert(new_id, ep);

            self.run_coroutine(new_id, Job::ServerInit(listener_tag.clone(), addr, port));
        }
    }

    /// Finish a pending non-blocking connect once its socket is writable,
    /// starting `client_init` on success or escalating to `connect_error`.
    fn finish_connect(&mut self, id: EndpointId) {
        let stream = match self.state.endpoints.get(&id) {
            Some(ep) => match ep.io.as_stream() {
                Some(s) => s,
                None => return,
            },
            None => return,
        };

        let result = stream.take_error().and_then(|maybe_err| match maybe_err {
            Some(err) => Err(err),
            None => stream.peer_addr().map(|_| ()),
        });

        match result {
            Ok(()) => {
                if let Some(ep) = self.state.endpoints.get_mut(&id) {
                    ep.state = State::Connected;
                    if let Some(timer) = ep.connect_timer.take() {
                        self.state.timers.cancel(timer);
                    }
                }
                let tag = self.state.endpoints.get(&id).and_then(|e| e.tag.clone());
                if let Some(tag) = &tag {
                    debug!("{:?}: connected", tag);
                }
                if let Some(tag) = tag {
                    self.run_coroutine(id, Job::ClientInit(tag));
                }
            }
            Err(err) => self.fail_connect(id, &err.to_string()),
        }
    }

    /// A pending connect's socket became writable but turned out to have
    /// failed (not merely still in progress): escalate to `connect_error`.
    /// Distinct from [`Reactor::fail_connect_timeout`], which fires when no
    /// writability ever arrives before the connect-timeout timer does.
    fn fail_connect(&mut self, id: EndpointId, detail: &str) {
        let tag = self.state.endpoints.get(&id).and_then(|e| e.tag.clone());
        if let Some(tag) = &tag {
            debug!("{:?}: connect failed: {}", tag, detail);
        }
        if let Some(tag) = tag {
            let detail = detail.to_string();
            self.run_direct(Some(id), move |ctx, handler| handler.connect_error(ctx, tag, detail));
        }
        self.state.dispose(id);
    }

    /// A connect-timeout timer fired before the pending connect ever became
    /// writable: per SPEC_FULL.md §4.1/§7 and the §8 worked example, this is
    /// surfaced through `error(tag, "Connection timed out")`, not
    /// `connect_error` — the latter is reserved for a connect that writes
    /// back and turns out to have failed.
    fn fail_connect_timeout(&mut self, id: EndpointId) {
        let tag = self.state.endpoints.get(&id).and_then(|e| e.tag.clone());
        if let Some(tag) = &tag {
            debug!("{:?}: connect timed out", tag);
        }
        if let Some(tag) = tag {
            self.run_direct(Some(id), move |ctx, handler| {
                handler.error(ctx, tag, "Connection timed out".to_string())
            });
        }
        self.state.dispose(id);
    }

    fn dispatch_writable(&mut self, id: EndpointId) {
        let was_connecting = matches!(self.state.endpoints.get(&id), Some(ep) if ep.state == State::Connecting);
        if was_connecting {
            self.finish_connect(id);
        }

        let flushed = match self.state.endpoints.get_mut(&id) {
            Some(ep) if ep.state == State::Connected => Some(ep.output.flush(&mut ep.io)),
            _ => None,
        };

        if let Some(Err(err)) = flushed {
            self.invoke_error(id, &err.to_string());
        }
    }

    fn service_read(&mut self, id: EndpointId, scratch: &mut [u8]) {
        let needed = match self.state.endpoints.get(&id).and_then(|e| e.coroutine.as_ref()) {
            Some(coroutine) if coroutine.alive => match coroutine.request_rx.try_recv() {
                Ok(Request::Need(n)) => Some(n),
                Ok(Request::Done) => {
                    self.finish_coroutine(id);
                    return;
                }
                Ok(Request::Panicked(detail)) => {
                    self.finish_panicked_coroutine(id, detail);
                    return;
                }
                Ok(other) => {
                    // A non-`Need` request arrived instead (the coroutine kept
                    // running after its last resume without blocking on a
                    // read); service it and let the next readiness pass
                    // revisit this endpoint for the read it actually wants.
                    self.apply_coroutine_request(id, other);
                    return;
                }
                Err(chan::TryRecvError::Empty) => return,
                Err(chan::TryRecvError::Disconnected) => None,
            },
            _ => None,
        };

        let Some(needed) = needed else {
            // No coroutine parked on a read: this is either a fresh endpoint
            // (spawn `recv_data`) or one whose coroutine already finished.
            self.spawn_recv_if_idle(id);
            return;
        };

        let buf = &mut scratch[..needed.min(scratch.len()).max(1)];
        let read = match self.state.endpoints.get_mut(&id) {
            Some(ep) => ep.io.read(buf),
            None => return,
        };

        match read {
            Ok(0) => self.invoke_error(id, "end of stream"),
            Ok(n) => {
                if let Some(ep) = self.state.endpoints.get(&id) {
                    if let Some(coroutine) = &ep.coroutine {
                        coroutine.feed(buf[..n].to_vec());
                    }
                }
                self.finish_coroutine_if_done(id);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => self.invoke_error(id, &err.to_string()),
        }
    }

    /// Spawn a fresh `recv_data` coroutine for an endpoint whose previous
    /// one (if any) has already finished.
    fn spawn_recv_if_idle(&mut self, id: EndpointId) {
        let idle = match self.state.endpoints.get(&id) {
            Some(ep) => ep.coroutine.as_ref().map(|c| !c.alive).unwrap_or(true),
            None => return,
        };
        if !idle {
            return;
        }
        let tag = match self.state.endpoints.get(&id).and_then(|e| e.tag.clone()) {
            Some(tag) => tag,
            None => return,
        };
        self.run_coroutine(id, Job::RecvData(tag));
    }

    /// Spawn a coroutine for `job` and pump it until it either parks on a
    /// read (`Need`) or finishes (`Done`), answering every other request
    /// synchronously in between.
    fn run_coroutine(&mut self, id: EndpointId, job: Job<H::Tag>) {
        let coroutine = Coroutine::spawn(self.handler.clone(), job);
        if let Some(ep) = self.state.endpoints.get_mut(&id) {
            ep.coroutine = Some(coroutine);
        }
        self.pump(id);
    }

    /// Drain a coroutine's requests until it parks on `Need` or sends `Done`.
    fn pump(&mut self, id: EndpointId) {
        loop {
            let request = match self.state.endpoints.get(&id).and_then(|e| e.coroutine.as_ref()) {
                Some(coroutine) if coroutine.alive => coroutine.request_rx.recv(),
                _ => return,
            };

            match request {
                Ok(Request::Need(_)) => return,
                Ok(Request::Done) => {
                    self.finish_coroutine(id);
                    return;
                }
                Ok(Request::Panicked(detail)) => {
                    self.finish_panicked_coroutine(id, detail);
                    return;
                }
                Ok(other) => self.apply_coroutine_request(id, other),
                Err(_) => return,
            }
        }
    }

    fn apply_coroutine_request(&mut self, id: EndpointId, request: Request<H::Tag>) {
        let resume = self.state.apply(Some(id), request);
        if let Some(ep) = self.state.endpoints.get(&id) {
            if let Some(coroutine) = &ep.coroutine {
                coroutine.ack(resume);
            }
        }
    }

    /// A coroutine already parked on `Need` just got fed bytes; keep pumping
    /// it in case it immediately asks for something else (or is done).
    fn finish_coroutine_if_done(&mut self, id: EndpointId) {
        self.pump(id);
    }

    /// A coroutine sent `Done`: dispose it if it asked to close itself, or
    /// escalate to `error` if the endpoint ended up in an error state
    /// (e.g. a hard read error or end-of-stream observed mid-suspension),
    /// or otherwise leave it registered for the next `recv_data`.
    fn finish_coroutine(&mut self, id: EndpointId) {
        let (closing, errored) = match self.state.endpoints.get_mut(&id) {
            Some(ep) => {
                if let Some(coroutine) = &mut ep.coroutine {
                    coroutine.alive = false;
                }
                (ep.closing, ep.state == State::Error)
            }
            None => return,
        };

        if errored {
            if let Some(detail) = self.state.endpoints.get(&id).and_then(|e| e.last_read_error.clone()) {
                self.invoke_error(id, &detail);
            } else {
                self.state.dispose(id);
            }
        } else if closing {
            self.state.dispose(id);
        }
    }

    /// A coroutine's handler callback panicked instead of returning or
    /// asking for more bytes. Rather than let the panic unwind through the
    /// coroutine thread and poison the shared handler `Mutex` for every
    /// other endpoint, the thread already caught it (see `coroutine.rs`)
    /// and reports it here like any other hard I/O error: mark the endpoint
    /// errored, escalate to `error` (or propagate to the caller) and
    /// dispose it, leaving every other endpoint's coroutine untouched.
    fn finish_panicked_coroutine(&mut self, id: EndpointId, detail: String) {
        if let Some(ep) = self.state.endpoints.get_mut(&id) {
            // The coroutine thread has already exited (it sent `Panicked` as
            // its last act); mark it dead so `dispose` doesn't try to shut
            // down and join a thread that's already finished.
            if let Some(coroutine) = &mut ep.coroutine {
                coroutine.alive = false;
            }
        }
        self.invoke_error(id, &detail);
    }

    /// Mark an endpoint errored and, if its handler opted in, invoke `error`
    /// before disposing it; otherwise propagate the error out of `start()`
    /// to whoever is running the reactor, since there is no handler willing
    /// to receive it.
    fn invoke_error(&mut self, id: EndpointId, detail: &str) {
        let (use_error_handler, tag) = match self.state.endpoints.get_mut(&id) {
            Some(ep) => {
                ep.state = State::Error;
                ep.last_read_error = Some(detail.to_string());
                (ep.use_error_handler, ep.tag.clone())
            }
            None => return,
        };

        // A coroutine still parked mid-read needs unblocking (with `Closed`)
        // before we can safely tear the endpoint down.
        let has_live_coroutine = matches!(self.state.endpoints.get(&id).and_then(|e| e.coroutine.as_ref()), Some(c) if c.alive);
        if has_live_coroutine {
            if let Some(ep) = self.state.endpoints.get_mut(&id) {
                if let Some(coroutine) = ep.coroutine.take() {
                    coroutine.shutdown();
                }
            }
        }

        if use_error_handler {
            if let Some(tag) = tag {
                error!("{:?}: escalating to handler: {}", tag, detail);
                let detail = detail.to_string();
                self.run_direct(Some(id), move |ctx, handler| handler.error(ctx, tag, detail));
            }
        } else {
            warn!(
                "endpoint error with no error handler opted in, propagating to the caller of start(): {}",
                detail
            );
            self.fatal.get_or_insert_with(|| Error::Io(io::Error::new(io::ErrorKind::Other, detail.to_string())));
        }

        self.state.dispose(id);
    }
}
