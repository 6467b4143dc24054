//! Main-thread coordinator.
//!
//! A single OS thread owns every GPU entry point. All other threads talk
//! to it by message passing: [`MainThreadHandle::call`] posts a closure
//! onto the coordinator's channel and blocks on a rendezvous reply.
//! [`MainThread::run`] must be called once on the pinned thread; it
//! drains the channel until the terminal sentinel. A nested loop
//! ([`MainThread::run_until`]) can be started from inside a job to pump
//! further jobs re-entrantly, which happens when an OS resize callback
//! fires while a user draw is in progress.
//!
//! With the `singlethread` feature, `call` runs the closure inline and no
//! coordinator thread is needed.

#[cfg(test)]
mod tests;

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

#[cfg(not(feature = "singlethread"))]
use crossbeam::channel::bounded;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::trace;

/// Error type for coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Clean shutdown sentinel.
    Terminated,
    /// The coordinator (or a caller) went away.
    Disconnected,
    /// Thread spawn failed.
    SpawnFailed(String),
    /// Thread join failed.
    JoinFailed(String),
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::Terminated => write!(f, "Main thread loop terminated"),
            ThreadError::Disconnected => write!(f, "Main thread channel disconnected"),
            ThreadError::SpawnFailed(s) => write!(f, "Thread spawn failed: {}", s),
            ThreadError::JoinFailed(s) => write!(f, "Thread join failed: {}", s),
        }
    }
}

impl std::error::Error for ThreadError {}

pub type ThreadResult<T> = std::result::Result<T, ThreadError>;

thread_local! {
    static ON_MAIN_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is running the coordinator loop.
#[must_use]
pub fn is_main_thread() -> bool {
    ON_MAIN_THREAD.with(Cell::get)
}

/// Debug witness used by GPU-touching code paths.
///
/// With the `singlethread` feature every thread passes the check.
pub fn assert_on_main_thread() {
    if cfg!(feature = "singlethread") {
        return;
    }
    debug_assert!(is_main_thread(), "must be called on the main thread");
}

enum Message {
    Job(Box<dyn FnOnce() + Send + 'static>),
    Terminate,
}

/// The coordinator half living on the pinned thread.
pub struct MainThread {
    rx: Receiver<Message>,
    // A Terminate observed inside a nested loop is deferred until the
    // outer loop regains control. Atomic so the pair can be shared
    // across threads behind an Arc.
    pending_terminate: AtomicBool,
}

/// The posting half handed to every other thread.
#[derive(Clone)]
pub struct MainThreadHandle {
    tx: Sender<Message>,
}

/// Create a coordinator pair.
#[must_use]
pub fn main_thread() -> (MainThread, MainThreadHandle) {
    let (tx, rx) = unbounded();
    (
        MainThread {
            rx,
            pending_terminate: AtomicBool::new(false),
        },
        MainThreadHandle { tx },
    )
}

struct MainGuard {
    was_main: bool,
}

impl MainGuard {
    fn enter() -> Self {
        let was_main = ON_MAIN_THREAD.with(|f| f.replace(true));
        Self { was_main }
    }
}

impl Drop for MainGuard {
    fn drop(&mut self) {
        let was_main = self.was_main;
        ON_MAIN_THREAD.with(|f| f.set(was_main));
    }
}

impl MainThread {
    /// Drain the channel until the terminal sentinel (returned as
    /// `ThreadError::Terminated`) or until every handle is dropped.
    pub fn run(&self) -> ThreadResult<()> {
        let _guard = MainGuard::enter();
        loop {
            if self.pending_terminate.swap(false, Ordering::AcqRel) {
                trace!("main thread loop: deferred terminate");
                return Err(ThreadError::Terminated);
            }
            match self.rx.recv() {
                Ok(Message::Job(job)) => job(),
                Ok(Message::Terminate) => return Err(ThreadError::Terminated),
                Err(_) => return Err(ThreadError::Disconnected),
            }
        }
    }

    /// Nested loop: pump jobs until `done` becomes true.
    ///
    /// Must be called on the coordinator thread, typically from inside a
    /// job that itself has to wait for further main-thread work. A
    /// Terminate observed here is deferred to the outer loop.
    pub fn run_until(&self, done: &AtomicBool) -> ThreadResult<()> {
        assert_on_main_thread();
        let _guard = MainGuard::enter();
        while !done.load(Ordering::Acquire) {
            match self.rx.recv() {
                Ok(Message::Job(job)) => job(),
                Ok(Message::Terminate) => self.pending_terminate.store(true, Ordering::Release),
                Err(_) => return Err(ThreadError::Disconnected),
            }
        }
        Ok(())
    }
}

impl MainThreadHandle {
    /// Run `f` on the main thread and block until it completes, returning
    /// its result. With the `singlethread` feature, runs `f` inline.
    pub fn call<R, F>(&self, f: F) -> ThreadResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        #[cfg(feature = "singlethread")]
        {
            Ok(f())
        }
        #[cfg(not(feature = "singlethread"))]
        {
            if is_main_thread() {
                // Re-entrant call from a job already on the main thread.
                return Ok(f());
            }
            let (reply_tx, reply_rx) = bounded(1);
            let job = Box::new(move || {
                let _ = reply_tx.send(f());
            });
            self.tx
                .send(Message::Job(job))
                .map_err(|_| ThreadError::Disconnected)?;
            reply_rx.recv().map_err(|_| ThreadError::Disconnected)
        }
    }

    /// Post the terminal sentinel; `MainThread::run` returns
    /// `ThreadError::Terminated` once it drains up to it.
    pub fn terminate(&self) -> ThreadResult<()> {
        self.tx
            .send(Message::Terminate)
            .map_err(|_| ThreadError::Disconnected)
    }
}

/// Handle to a spawned worker thread (the game thread, usually).
pub struct Thread<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> Thread<T> {
    /// Spawn a named thread running `f`.
    pub fn spawn<F>(name: Option<&str>, f: F) -> ThreadResult<Self>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(n) = name {
            builder = builder.name(n.to_string());
        }
        let handle = builder
            .spawn(f)
            .map_err(|e| ThreadError::SpawnFailed(e.to_string()))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the thread to finish and return its result.
    pub fn join(mut self) -> ThreadResult<T> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ThreadError::JoinFailed("thread panicked".to_string())),
            None => Err(ThreadError::JoinFailed("thread already joined".to_string())),
        }
    }

    /// Check if the thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }
}
