//! Single-threaded completion dispatcher
//!
//! Producers on any thread post callbacks through a [`LoopHandle`]; the thread
//! that owns the [`EventLoop`] runs them in posting order from [`EventLoop::exec`],
//! each with exclusive access to the loop context `C`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use flume::RecvTimeoutError;
use tracing::{debug, info, trace};

/// Deferred work run on the loop thread.
pub type Callback<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Why `exec` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    TimedOut,
    Exited(i32),
    Cancelled,
}

impl ExitStatus {
    /// Process exit code for this status.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::TimedOut => 0,
            ExitStatus::Exited(code) => code,
            ExitStatus::Cancelled => 130,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::TimedOut => f.write_str("timed out"),
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

enum Message<C> {
    Call { callback: Callback<C>, posted: Instant },
    Wake,
}

#[derive(Default)]
struct Stats {
    posted: AtomicUsize,
    executed: AtomicUsize,
}

struct Shared {
    exit: AtomicCell<Option<ExitStatus>>,
    stats: CachePadded<Stats>,
}

impl Shared {
    /// First request wins until `exec` consumes it.
    fn request_exit(&self, status: ExitStatus) -> bool {
        self.exit.compare_exchange(None, Some(status)).is_ok()
    }
}

/// Counters since the loop was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub posted: usize,
    pub executed: usize,
}

/// Thread-safe handle for posting work to an [`EventLoop`].
pub struct LoopHandle<C> {
    tx: flume::Sender<Message<C>>,
    shared: Arc<Shared>,
}

impl<C> Clone for LoopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C> LoopHandle<C> {
    /// Run `callback` on the loop thread during a later dispatch cycle.
    pub fn call_later<F>(&self, callback: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        post(&self.tx, &self.shared, Box::new(callback));
    }

    /// Ask the loop to return `ExitStatus::Exited(code)`.
    pub fn exit(&self, code: i32) {
        wake(&self.tx, &self.shared, ExitStatus::Exited(code));
    }

    /// Ask the loop to return `ExitStatus::Cancelled`.
    pub fn cancel(&self) {
        wake(&self.tx, &self.shared, ExitStatus::Cancelled);
    }
}

fn post<C>(tx: &flume::Sender<Message<C>>, shared: &Shared, callback: Callback<C>) {
    shared.stats.posted.fetch_add(1, Ordering::Relaxed);
    // The loop keeps a receiver alive for as long as it exists
    if tx
        .send(Message::Call {
            callback,
            posted: Instant::now(),
        })
        .is_err()
    {
        debug!("Event loop gone, dropping callback");
    }
}

fn wake<C>(tx: &flume::Sender<Message<C>>, shared: &Shared, status: ExitStatus) {
    if shared.request_exit(status) {
        let _ = tx.send(Message::Wake);
    }
}

pub struct EventLoop<C> {
    tx: flume::Sender<Message<C>>,
    rx: flume::Receiver<Message<C>>,
    shared: Arc<Shared>,
    deadline: Option<Instant>,
}

impl<C> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventLoop<C> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            shared: Arc::new(Shared {
                exit: AtomicCell::new(None),
                stats: CachePadded::new(Stats::default()),
            }),
            deadline: None,
        }
    }

    pub fn handle(&self) -> LoopHandle<C> {
        LoopHandle {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn call_later<F>(&self, callback: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        post(&self.tx, &self.shared, Box::new(callback));
    }

    /// Arm the single countdown, replacing any earlier one.
    pub fn timeout(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn exit(&self, code: i32) {
        wake(&self.tx, &self.shared, ExitStatus::Exited(code));
    }

    /// Dispatch callbacks until the timeout fires, `exit` is called or the
    /// loop is cancelled.
    pub fn exec(&mut self, ctx: &mut C) -> ExitStatus {
        debug!(deadline = ?self.deadline.map(|d| d.saturating_duration_since(Instant::now())), "Event loop running");
        let status = loop {
            if let Some(status) = self.shared.exit.swap(None) {
                break status;
            }

            let next = match self.deadline {
                Some(deadline) => self.rx.recv_deadline(deadline),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(message) => {
                    self.dispatch(message, ctx);
                    // A queue that never drains must not hold off the timer
                    if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        break self.expire();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break self.expire(),
                Err(RecvTimeoutError::Disconnected) => break ExitStatus::Cancelled,
            }
        };

        info!(%status, "Event loop finished");
        status
    }

    /// Disarm the countdown. An exit requested meanwhile still takes precedence.
    fn expire(&mut self) -> ExitStatus {
        self.deadline = None;
        self.shared.exit.swap(None).unwrap_or(ExitStatus::TimedOut)
    }

    /// Run the callbacks already queued, without blocking. Callbacks those
    /// callbacks post wait for the next cycle.
    pub fn dispatch_pending(&mut self, ctx: &mut C) -> usize {
        let queued = self.rx.len();
        let mut executed = 0;
        for _ in 0..queued {
            let Ok(message) = self.rx.try_recv() else {
                break;
            };
            if matches!(message, Message::Call { .. }) {
                executed += 1;
            }
            self.dispatch(message, ctx);
        }
        executed
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            posted: self.shared.stats.posted.load(Ordering::Relaxed),
            executed: self.shared.stats.executed.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, message: Message<C>, ctx: &mut C) {
        let Message::Call { callback, posted } = message else {
            trace!("Event loop woken");
            return;
        };
        metrics::histogram!("event_loop_dispatch_latency_us")
            .record(posted.elapsed().as_micros() as f64);
        callback(ctx);
        self.shared.stats.executed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("event_loop_callbacks_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn callbacks_run_in_posting_order_across_threads() {
        let mut event_loop: EventLoop<Vec<u32>> = EventLoop::new();
        let handle = event_loop.handle();

        let first = {
            let handle = handle.clone();
            thread::spawn(move || {
                for n in 0..100 {
                    handle.call_later(move |seen: &mut Vec<u32>| seen.push(n));
                }
            })
        };
        first.join().unwrap();
        let second = {
            let handle = handle.clone();
            thread::spawn(move || {
                for n in 100..200 {
                    handle.call_later(move |seen: &mut Vec<u32>| seen.push(n));
                }
                handle.call_later(|_| {});
            })
        };
        second.join().unwrap();
        let exit = handle.clone();
        event_loop.call_later(move |_| exit.exit(7));

        let mut seen = Vec::new();
        assert_eq!(event_loop.exec(&mut seen), ExitStatus::Exited(7));
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
        assert_eq!(event_loop.stats().executed, 202);
    }

    #[test]
    fn timeout_ends_an_idle_loop() {
        let mut event_loop: EventLoop<()> = EventLoop::new();
        event_loop.timeout(Duration::from_millis(50));
        let started = Instant::now();
        let status = event_loop.exec(&mut ());
        assert_eq!(status, ExitStatus::TimedOut);
        assert_eq!(status.code(), 0);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn first_exit_request_wins() {
        let mut event_loop: EventLoop<()> = EventLoop::new();
        let handle = event_loop.handle();
        handle.exit(3);
        handle.exit(4);
        handle.cancel();
        assert_eq!(event_loop.exec(&mut ()), ExitStatus::Exited(3));

        // Consumed by the previous run
        event_loop.timeout(Duration::from_millis(10));
        assert_eq!(event_loop.exec(&mut ()), ExitStatus::TimedOut);
    }

    #[test]
    fn cancel_from_another_thread_wakes_the_loop() {
        let mut event_loop: EventLoop<()> = EventLoop::new();
        let handle = event_loop.handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.cancel();
        });
        let status = event_loop.exec(&mut ());
        canceller.join().unwrap();
        assert_eq!(status, ExitStatus::Cancelled);
        assert_eq!(status.code(), 130);
    }

    #[test]
    fn dispatch_pending_runs_only_what_is_queued() {
        let mut event_loop: EventLoop<Vec<&'static str>> = EventLoop::new();
        let handle = event_loop.handle();
        let inner = handle.clone();
        handle.call_later(move |log: &mut Vec<&'static str>| {
            log.push("outer");
            inner.call_later(|log: &mut Vec<&'static str>| log.push("inner"));
        });

        let mut log = Vec::new();
        assert_eq!(event_loop.dispatch_pending(&mut log), 1);
        assert_eq!(log, ["outer"]);
        assert_eq!(event_loop.dispatch_pending(&mut log), 1);
        assert_eq!(log, ["outer", "inner"]);
        assert_eq!(event_loop.dispatch_pending(&mut log), 0);
        assert_eq!(
            event_loop.stats(),
            DispatchStats {
                posted: 2,
                executed: 2
            }
        );
    }

    struct Reposting {
        handle: LoopHandle<Reposting>,
        runs: usize,
    }

    fn repost(state: &mut Reposting) {
        state.runs += 1;
        state.handle.call_later(repost);
    }

    #[test]
    fn timeout_fires_while_callbacks_keep_arriving() {
        let mut event_loop: EventLoop<Reposting> = EventLoop::new();
        let mut state = Reposting {
            handle: event_loop.handle(),
            runs: 0,
        };
        event_loop.call_later(repost);
        event_loop.timeout(Duration::from_millis(20));

        let started = Instant::now();
        assert_eq!(event_loop.exec(&mut state), ExitStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(state.runs > 0);
    }
}
