// src/os/thread.rs

//! Kernel threads with a lookup for "the thread object running here".
//!
//! Every [`OsThread`] is a 1:1 wrapper over a named `std::thread`. The spawned
//! body sees its own [`ThreadHandle`] through [`current`], and the spawner keeps
//! the same handle through [`OsThread::handle`]. Threads not spawned through this
//! module have no handle.
//!
//! # Cancellation
//!
//! [`OsThread::cancel`] is deferred, in the pthread sense. The target keeps
//! running until it reaches a cancellation point ([`sleep`], [`yield_now`] or
//! [`test_cancel`]) and then unwinds out of its body. Destructors run during the
//! unwind but nothing else is promised: a cancelled thread may leave channel
//! cursors mid-burst. Do not use it on a hot control path.

use log::{debug, trace};
use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ThreadError;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Scheduling hint accepted at spawn time.
///
/// Applied best-effort as a nice value on Linux. No real-time class is ever
/// requested and failure to apply it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    fn nice(self) -> i32 {
        match self {
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::High => -5,
        }
    }
}

/// Unwind payload used to leave a cancelled thread's body.
struct Cancelled;

#[derive(Debug)]
struct ThreadInner {
    id: u64,
    name: String,
    priority: Priority,
    cancel_requested: AtomicBool,
    /// Set by the thread itself once running; used to unpark a sleeping target.
    thread: OnceLock<std::thread::Thread>,
}

/// Shared identity of an [`OsThread`].
///
/// Cheap to clone. The same handle is returned by [`OsThread::handle`] on the
/// spawning side and by [`current`] on the spawned thread.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    inner: Arc<ThreadInner>,
}

impl ThreadHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Requests deferred cancellation. See the module docs.
    pub fn cancel(&self) {
        debug!("Cancellation requested for thread '{}'", self.inner.name);
        self.inner.cancel_requested.store(true, Ordering::Release);
        if let Some(thread) = self.inner.thread.get() {
            thread.unpark();
        }
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ThreadHandle {}

/// Builder for [`OsThread`], in the style of `std::thread::Builder`.
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    name: Option<String>,
    priority: Priority,
}

impl ThreadBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Spawns the thread and binds `body` to it.
    ///
    /// # Errors
    ///
    /// `ThreadError::Spawn` if the kernel refuses to create the thread.
    pub fn spawn<F, T>(self, body: F) -> Result<OsThread<T>, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let name = self.name.unwrap_or_else(|| format!("flowrt-{id}"));
        let handle = ThreadHandle {
            inner: Arc::new(ThreadInner {
                id,
                name: name.clone(),
                priority: self.priority,
                cancel_requested: AtomicBool::new(false),
                thread: OnceLock::new(),
            }),
        };

        let builder = std::thread::Builder::new().name(name.clone());

        let own_handle = handle.clone();
        let join = builder
            .spawn(move || {
                let _ = own_handle.inner.thread.set(std::thread::current());
                apply_priority(own_handle.priority());
                CURRENT.with(|slot| *slot.borrow_mut() = Some(own_handle));
                body()
            })
            .map_err(|source| ThreadError::Spawn {
                name: name.clone(),
                source,
            })?;

        debug!("Spawned thread '{}' (id {}, {:?})", name, id, self.priority);
        Ok(OsThread { handle, join })
    }
}

/// One running kernel thread whose body returns `T`.
#[derive(Debug)]
pub struct OsThread<T> {
    handle: ThreadHandle,
    join: JoinHandle<T>,
}

impl<T> OsThread<T> {
    /// Spawns `body` on a new thread with the given name and default priority.
    ///
    /// # Errors
    ///
    /// `ThreadError::Spawn` if the kernel refuses to create the thread.
    pub fn start<F>(name: impl Into<String>, body: F) -> Result<Self, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        ThreadBuilder::new().name(name).spawn(body)
    }

    #[must_use]
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    /// Requests deferred cancellation. See the module docs.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Blocks until the body returns.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the thread unwound at a cancellation point, `Panicked`
    /// if the body panicked.
    pub fn join(self) -> Result<T, ThreadError> {
        let name = self.handle.name().to_string();
        self.join.join().map_err(|payload| {
            if payload.is::<Cancelled>() {
                debug!("Thread '{}' exited through cancellation", name);
                ThreadError::Cancelled(name)
            } else {
                ThreadError::Panicked {
                    name,
                    message: panic_message(payload.as_ref()),
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: Priority) {
    if priority == Priority::Normal {
        return;
    }
    let tid = nix::unistd::gettid();
    // Safety: setpriority only reads its scalar arguments.
    let rc = unsafe {
        libc::setpriority(libc::PRIO_PROCESS, tid.as_raw() as libc::id_t, priority.nice())
    };
    if rc == -1 {
        debug!(
            "Could not apply {:?} priority to tid {}: {}",
            priority,
            tid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(_priority: Priority) {}

/// The handle of the [`OsThread`] running on the calling kernel thread.
///
/// `None` on threads that were not spawned through this module, including the
/// main thread.
#[must_use]
pub fn current() -> Option<ThreadHandle> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Cancellation point. Unwinds the calling thread if it has been cancelled.
pub fn test_cancel() {
    let cancelled = CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(ThreadHandle::is_cancel_requested)
    });
    if cancelled {
        trace!("Cancellation point reached, unwinding");
        std::panic::resume_unwind(Box::new(Cancelled));
    }
}

/// Lets other ready threads run. Also a cancellation point.
///
/// Only a hint: nothing guarantees another thread actually runs.
pub fn yield_now() {
    test_cancel();
    if let Err(e) = nix::sched::sched_yield() {
        trace!("sched_yield failed: {}", e);
    }
}

/// Blocks for at least `duration`. Also a cancellation point.
///
/// `sleep(Duration::ZERO)` only yields. On an [`OsThread`] a pending
/// cancellation cuts the sleep short.
pub fn sleep(duration: Duration) {
    if duration.is_zero() {
        yield_now();
        return;
    }
    test_cancel();
    if current().is_none() {
        std::thread::sleep(duration);
        return;
    }

    let deadline = Instant::now().checked_add(duration);
    loop {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        };
        if remaining.is_zero() {
            return;
        }
        std::thread::park_timeout(remaining);
        test_cancel();
    }
}
