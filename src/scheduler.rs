//! Fire-and-forget task pool with periodic timers.
//!
//! A single dispatcher task owns the task list and the timer map. Every
//! other party talks to it through a command channel, so no state is shared
//! behind locks. The dispatcher wakes once per scan interval to collect
//! finished tasks and to fire due timers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::RelayError;

/// Period of the collection and timer passes
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(100);

pub type TimerId = u64;

/// Future accepted by the scheduler
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Callback invoked each time a timer fires
pub type TimerCallback = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Returns `Ok` when it dealt with the failure
pub type ErrorHandler = Arc<dyn Fn(&TaskFailure) -> anyhow::Result<()> + Send + Sync>;

/// Why a background task did not finish cleanly
#[derive(Debug)]
pub enum TaskFailure {
    Failed { task: String, error: anyhow::Error },
    Panicked { task: String, message: String },
}

impl TaskFailure {
    pub fn task(&self) -> &str {
        match self {
            TaskFailure::Failed { task, .. } | TaskFailure::Panicked { task, .. } => task,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Failed { task, error } => write!(f, "task '{}' failed: {:#}", task, error),
            TaskFailure::Panicked { task, message } => {
                write!(f, "task '{}' panicked: {}", task, message)
            }
        }
    }
}

impl From<&TaskFailure> for RelayError {
    fn from(failure: &TaskFailure) -> Self {
        let reason = match failure {
            TaskFailure::Failed { error, .. } => format!("{:#}", error),
            TaskFailure::Panicked { message, .. } => message.clone(),
        };
        RelayError::SchedulerTask {
            task: failure.task().to_string(),
            reason,
        }
    }
}

enum Command {
    Track(TrackedTask),
    AddTimer {
        id: TimerId,
        name: String,
        callback: TimerCallback,
        interval: Duration,
    },
    RemoveTimer(TimerId),
    AddErrorHandler(ErrorHandler),
    TaskCount(oneshot::Sender<usize>),
    TimerCount(oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

struct TrackedTask {
    name: String,
    handle: JoinHandle<anyhow::Result<()>>,
}

struct Timer {
    name: String,
    callback: TimerCallback,
    interval: Duration,
    next_due: Instant,
}

/// Handle to the process-wide task pool. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    commands: mpsc::UnboundedSender<Command>,
    next_timer_id: AtomicU64,
    running: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a scheduler on the current tokio runtime
    pub fn new() -> Self {
        Self::with_scan_interval(DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_scan_interval(scan_interval: Duration) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            tasks: Vec::new(),
            timers: HashMap::new(),
            next_due: None,
            handlers: Vec::new(),
        };
        let handle = tokio::spawn(dispatcher.run(receiver, scan_interval));
        debug!(scan_ms = scan_interval.as_millis() as u64, "Scheduler started");

        Self {
            inner: Arc::new(SchedulerInner {
                commands,
                next_timer_id: AtomicU64::new(1),
                running: AtomicBool::new(true),
                dispatcher: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run `future` in the background. It starts immediately; failures go
    /// to the error handlers once the next collection pass sees them.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);
        if let Err(mpsc::error::SendError(Command::Track(task))) =
            self.inner.commands.send(Command::Track(TrackedTask { name, handle }))
        {
            warn!(task = %task.name, "Scheduler stopped, cancelling task");
            task.handle.abort();
        }
    }

    /// Fire `callback` every `interval`, starting one interval from now
    pub fn register_timer<F, Fut>(&self, name: impl Into<String>, interval: Duration, callback: F) -> TimerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::SeqCst);
        let name = name.into();
        let callback: TimerCallback = Arc::new(move || callback().boxed());
        debug!(timer_id = id, timer = %name, interval_ms = interval.as_millis() as u64, "Registering timer");
        let _ = self.inner.commands.send(Command::AddTimer {
            id,
            name,
            callback,
            interval,
        });
        id
    }

    pub fn cancel_timer(&self, id: TimerId) {
        debug!(timer_id = id, "Cancelling timer");
        let _ = self.inner.commands.send(Command::RemoveTimer(id));
    }

    /// Handlers run in registration order for every task failure
    pub fn add_error_handler<F>(&self, handler: F)
    where
        F: Fn(&TaskFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let _ = self
            .inner
            .commands
            .send(Command::AddErrorHandler(Arc::new(handler)));
    }

    /// Number of tasks not yet collected
    pub async fn task_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::TaskCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn timer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::TimerCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cancel every running task and halt the dispatcher. Idempotent.
    pub async fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("Stopping scheduler");
            let (tx, rx) = oneshot::channel();
            if self.inner.commands.send(Command::Stop(tx)).is_ok() {
                let _ = rx.await;
            }
        }

        if let Some(handle) = self.inner.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

struct Dispatcher {
    tasks: Vec<TrackedTask>,
    timers: HashMap<TimerId, Timer>,
    next_due: Option<Instant>,
    handlers: Vec<ErrorHandler>,
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, scan_interval: Duration) {
        let mut ticker = interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.apply(command),
                    None => {
                        // every handle dropped without stop()
                        self.shutdown().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.collect_finished().await;
                    self.fire_due_timers();
                }
            }
        }

        debug!("Scheduler dispatcher exited");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Track(task) => {
                trace!(task = %task.name, "Tracking task");
                self.tasks.push(task);
            }
            Command::AddTimer {
                id,
                name,
                callback,
                interval,
            } => {
                let next_due = Instant::now() + interval;
                self.timers.insert(
                    id,
                    Timer {
                        name,
                        callback,
                        interval,
                        next_due,
                    },
                );
                if self.next_due.map_or(true, |due| next_due < due) {
                    self.next_due = Some(next_due);
                }
            }
            Command::RemoveTimer(id) => {
                self.timers.remove(&id);
            }
            Command::AddErrorHandler(handler) => self.handlers.push(handler),
            Command::TaskCount(reply) => {
                let _ = reply.send(self.tasks.len());
            }
            Command::TimerCount(reply) => {
                let _ = reply.send(self.timers.len());
            }
            Command::Stop(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn collect_finished(&mut self) {
        if !self.tasks.iter().any(|task| task.handle.is_finished()) {
            return;
        }

        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|task| task.handle.is_finished());
        self.tasks = pending;

        for task in finished {
            self.finish(task).await;
        }
    }

    async fn finish(&self, task: TrackedTask) {
        match task.handle.await {
            Ok(Ok(())) => trace!(task = %task.name, "Task completed"),
            Ok(Err(error)) => self.report(TaskFailure::Failed {
                task: task.name,
                error,
            }),
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.report(TaskFailure::Panicked {
                    task: task.name,
                    message,
                });
            }
            Err(_) => trace!(task = %task.name, "Task cancelled"),
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        match self.next_due {
            Some(due) if now >= due => {}
            _ => return,
        }

        let mut next_due: Option<Instant> = None;
        let mut fired = Vec::new();
        for timer in self.timers.values_mut() {
            if now >= timer.next_due {
                // re-arm before the callback runs so a slow callback can't re-enter
                timer.next_due = now + timer.interval;
                fired.push((timer.name.clone(), (timer.callback)()));
            }
            if next_due.map_or(true, |due| timer.next_due < due) {
                next_due = Some(timer.next_due);
            }
        }
        self.next_due = next_due;

        for (name, future) in fired {
            trace!(timer = %name, "Timer fired");
            self.tasks.push(TrackedTask {
                name,
                handle: tokio::spawn(future),
            });
        }
    }

    fn report(&self, failure: TaskFailure) {
        let mut handled = false;
        for handler in &self.handlers {
            match handler(&failure) {
                Ok(()) => handled = true,
                Err(e) => error!(task = %failure.task(), error = %e, "Error handler failed"),
            }
        }

        if !handled {
            error!(task = %failure.task(), "Unhandled background failure: {}", failure);
        }
    }

    async fn shutdown(&mut self) {
        info!(tasks = self.tasks.len(), timers = self.timers.len(), "Cancelling scheduled work");
        self.timers.clear();
        self.next_due = None;

        for task in &self.tasks {
            if !task.handle.is_finished() {
                task.handle.abort();
            }
        }
        for task in std::mem::take(&mut self.tasks) {
            self.finish(task).await;
        }
    }
}
