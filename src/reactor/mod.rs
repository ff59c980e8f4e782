// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker pool and one-shot readiness reactor.
//!
//! A registration pairs an event source with a task. The reactor waits for
//! the requested interest, invokes the task exactly once, and then does what
//! the task's [`Decision`] says: wait again with a (possibly different)
//! interest, or drop the registration together with its source. Because the
//! decision is the callback's return value, a registration can neither be
//! forgotten un-armed nor removed twice.
//!
//! Each registration moves through `Idle -> Armed -> Firing -> Armed ...`
//! and ends in `Idle` once removed. Callbacks of different registrations run
//! concurrently on the worker threads; a single registration never has two
//! callbacks in flight.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;
use tokio::runtime::{self, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::service::WorkerPoolConfig;
use crate::{AppError, AppResult};

pub type Token = u64;

/// Readiness a registration waits for. Error and hang-up conditions are
/// always reported, whatever the interest.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const IN: Interest = Interest(0b01);
    pub const OUT: Interest = Interest(0b10);

    pub fn is_in(self) -> bool {
        self.0 & Self::IN.0 != 0
    }

    pub fn is_out(self) -> bool {
        self.0 & Self::OUT.0 != 0
    }

    fn to_tokio(self) -> tokio::io::Interest {
        match (self.is_in(), self.is_out()) {
            (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            (false, true) => tokio::io::Interest::WRITABLE,
            _ => tokio::io::Interest::READABLE,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_in(), self.is_out()) {
            (true, true) => f.write_str("IN|OUT"),
            (false, true) => f.write_str("OUT"),
            _ => f.write_str("IN"),
        }
    }
}

/// Event mask delivered to a callback.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const IN: Readiness = Readiness(0b0001);
    pub const OUT: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    pub const HANGUP: Readiness = Readiness(0b1000);

    pub fn is_readable(self) -> bool {
        self.0 & Self::IN.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::OUT.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP.0 != 0
    }

    /// Error or hang-up bit set.
    pub fn is_failed(self) -> bool {
        self.is_error() || self.is_hangup()
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Self) -> Self::Output {
        Readiness(self.0 | rhs.0)
    }
}

impl From<tokio::io::Ready> for Readiness {
    fn from(ready: tokio::io::Ready) -> Self {
        let mut readiness = Readiness::default();
        if ready.is_readable() {
            readiness = readiness | Readiness::IN;
        }
        if ready.is_writable() {
            readiness = readiness | Readiness::OUT;
        }
        if ready.is_error() {
            readiness = readiness | Readiness::ERROR;
        }
        if ready.is_read_closed() || ready.is_write_closed() {
            readiness = readiness | Readiness::HANGUP;
        }
        readiness
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_readable() {
            names.push("IN");
        }
        if self.is_writable() {
            names.push("OUT");
        }
        if self.is_error() {
            names.push("ERR");
        }
        if self.is_hangup() {
            names.push("HUP");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// What a callback wants done with its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Wait for the next notification with this interest.
    Rearm(Interest),
    /// Drop the registration and its source.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationState {
    Idle = 0,
    Armed = 1,
    Firing = 2,
}

impl RegistrationState {
    fn from_u8(value: u8) -> RegistrationState {
        match value {
            1 => RegistrationState::Armed,
            2 => RegistrationState::Firing,
            _ => RegistrationState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Listener,
    Dialer,
    Selector,
    Receiver,
    Timer,
}

/// Callback half of a registration.
pub trait ReactorTask: Send + 'static {
    fn kind(&self) -> TaskKind;

    fn on_event(
        &mut self,
        token: Token,
        events: Readiness,
    ) -> impl Future<Output = Decision> + Send;
}

/// Event source half of a registration.
pub enum Source {
    Stream(Arc<TcpStream>),
    Listener(Arc<AsyncFd<net::TcpListener>>),
    Timer(Interval),
}

impl Source {
    async fn ready(&mut self, interest: Interest) -> Readiness {
        match self {
            Source::Stream(stream) => match stream.ready(interest.to_tokio()).await {
                Ok(ready) => Readiness::from(ready),
                Err(_) => Readiness::ERROR,
            },
            // clear before the callback drains the accept queue, so a
            // connection arriving mid-drain raises a fresh edge
            Source::Listener(listener) => match listener.readable().await {
                Ok(mut guard) => {
                    guard.clear_ready();
                    Readiness::IN
                }
                Err(_) => Readiness::ERROR,
            },
            Source::Timer(interval) => {
                interval.tick().await;
                Readiness::IN
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrationInfo {
    pub token: Token,
    pub kind: TaskKind,
    pub state: RegistrationState,
}

struct Registration {
    kind: TaskKind,
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registrations {
    entries: Mutex<HashMap<Token, Registration>>,
}

pub struct Reactor {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    registrations: Arc<Registrations>,
    next_token: AtomicU64,
    closed: AtomicBool,
    max_registrations: usize,
}

impl Reactor {
    /// Start the worker pool.
    pub fn new(config: &WorkerPoolConfig, max_registrations: usize) -> AppResult<Reactor> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_stack_size(config.thread_stack_size)
            .thread_name("stonenet-worker")
            .enable_all()
            .build()?;
        debug!(
            workers = config.worker_threads(),
            stack = config.thread_stack_size,
            "reactor worker pool started"
        );
        Ok(Reactor {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            registrations: Arc::new(Registrations::default()),
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            max_registrations,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand a connected or connecting socket over to the worker pool.
    pub fn stream(&self, stream: net::TcpStream) -> AppResult<Arc<TcpStream>> {
        let _guard = self.handle.enter();
        Ok(Arc::new(TcpStream::from_std(stream)?))
    }

    pub fn listener(
        &self,
        listener: net::TcpListener,
    ) -> AppResult<Arc<AsyncFd<net::TcpListener>>> {
        let _guard = self.handle.enter();
        Ok(Arc::new(AsyncFd::new(listener)?))
    }

    pub fn timer(&self, period: Duration) -> Source {
        let _guard = self.handle.enter();
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Source::Timer(interval)
    }

    /// Register `task` to fire once `source` reports `interest`.
    pub fn add<T: ReactorTask>(
        &self,
        source: Source,
        interest: Interest,
        task: T,
    ) -> AppResult<Token> {
        let mut entries = self.registrations.entries.lock();
        if self.is_closed() {
            return Err(AppError::ReactorClosed);
        }
        if entries.len() >= self.max_registrations {
            return Err(AppError::ResourceExhausted(format!(
                "{} reactor registrations in use",
                entries.len()
            )));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let kind = task.kind();
        let state = Arc::new(AtomicU8::new(RegistrationState::Idle as u8));
        // the spawned task deregisters itself through this same lock, so it
        // cannot run ahead of the insert below
        let handle = self.handle.spawn(drive(
            self.registrations.clone(),
            token,
            source,
            interest,
            task,
            state.clone(),
        ));
        entries.insert(
            token,
            Registration {
                kind,
                state,
                handle,
            },
        );
        trace!(token, ?kind, ?interest, "registration added");
        Ok(token)
    }

    /// Cancel a registration from outside its callback. Returns false when it
    /// was already gone.
    pub fn remove(&self, token: Token) -> bool {
        let removed = self.registrations.entries.lock().remove(&token);
        match removed {
            Some(registration) => {
                registration.handle.abort();
                trace!(token, kind = ?registration.kind, "registration cancelled");
                true
            }
            None => false,
        }
    }

    /// Visit a snapshot of every live registration. The visitor runs without
    /// the registration lock held and may call [`Reactor::remove`].
    pub fn foreach<F: FnMut(&RegistrationInfo)>(&self, mut visitor: F) {
        let infos: Vec<RegistrationInfo> = self
            .registrations
            .entries
            .lock()
            .iter()
            .map(|(token, registration)| RegistrationInfo {
                token: *token,
                kind: registration.kind,
                state: RegistrationState::from_u8(registration.state.load(Ordering::Acquire)),
            })
            .collect();
        for info in &infos {
            visitor(info);
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new registrations, cancel the live ones and stop the workers.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tokens = Vec::new();
        self.foreach(|info| tokens.push(info.token));
        for token in tokens {
            self.remove(token);
        }
        if let Some(runtime) = self.runtime.lock().take() {
            // blocking for the workers is only allowed outside the pool
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
        debug!("reactor shut down");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drive<T: ReactorTask>(
    registrations: Arc<Registrations>,
    token: Token,
    mut source: Source,
    mut interest: Interest,
    mut task: T,
    state: Arc<AtomicU8>,
) {
    loop {
        state.store(RegistrationState::Armed as u8, Ordering::Release);
        let events = source.ready(interest).await;
        state.store(RegistrationState::Firing as u8, Ordering::Release);
        match task.on_event(token, events).await {
            Decision::Rearm(next) => interest = next,
            Decision::Remove => break,
        }
    }
    state.store(RegistrationState::Idle as u8, Ordering::Release);
    // release the descriptor before the registration disappears
    drop(task);
    drop(source);
    registrations.entries.lock().remove(&token);
    trace!(token, "registration removed");
}
