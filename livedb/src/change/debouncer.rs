use super::ChangeRecord;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::oneshot;

type FlushFn = dyn Fn(ChangeRecord) + Send + Sync;

type Batch = (ChangeRecord, Vec<oneshot::Sender<()>>);

#[derive(Default)]
struct DebounceState {
    pending: Option<ChangeRecord>,
    waiters: Vec<oneshot::Sender<()>>,
    generation: u64,
    ready: VecDeque<Batch>,
    delivering: Option<ThreadId>,
}

impl DebounceState {
    /// Move the pending record to the delivery queue.
    fn seal(&mut self) {
        if let Some(record) = self.pending.take() {
            let waiters = std::mem::take(&mut self.waiters);
            self.ready.push_back((record, waiters));
        }
    }
}

/// Releases delivery if `on_flush` panics.
struct Delivering<'a> {
    debouncer: &'a ChangeRecordDebouncer,
    finished: bool,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.debouncer.lock().delivering = None;
            self.debouncer.idle.notify_all();
        }
    }
}

/// Coalesces change records of the same class and kind that arrive within
/// one debounce window into a single flush.
///
/// Every call restarts the window. A record of a different class or kind
/// flushes whatever is pending first, so flushes keep commit order.
///
/// `on_flush` runs without the debouncer locked and may call back into it.
/// A flush requested from inside `on_flush` is delivered right after the
/// current one returns.
#[derive(Clone)]
pub struct ChangeRecordDebouncer {
    delay: Duration,
    on_flush: Arc<FlushFn>,
    state: Arc<Mutex<DebounceState>>,
    idle: Arc<Condvar>,
}

impl ChangeRecordDebouncer {
    pub fn new(delay: Duration, on_flush: impl Fn(ChangeRecord) + Send + Sync + 'static) -> Self {
        ChangeRecordDebouncer {
            delay,
            on_flush: Arc::new(on_flush),
            state: Arc::new(Mutex::new(DebounceState::default())),
            idle: Arc::new(Condvar::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a record. The returned future resolves once the batch holding
    /// it has been flushed. Must be called from within a tokio runtime.
    pub fn accumulate(&self, record: ChangeRecord) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut state = self.lock();
            match state.pending.as_mut() {
                Some(pending) if pending.can_append(&record) => {
                    // can_append was checked, append cannot fail
                    let _ = pending.append(record);
                }
                Some(_) => {
                    state.seal();
                    state.pending = Some(record);
                }
                None => state.pending = Some(record),
            }
            state.waiters.push(tx);
            state.generation += 1;
            state.generation
        };
        self.deliver();

        let debouncer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debouncer.delay).await;
            let due = {
                let mut state = debouncer.lock();
                let due = state.generation == generation;
                if due {
                    state.seal();
                }
                due
            };
            if due {
                debouncer.deliver();
            }
        });

        async move {
            let _ = rx.await;
        }
    }

    /// Flush the pending record now, if any. Returns once it has been
    /// delivered, except when called from `on_flush` itself.
    pub fn flush(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        state.seal();
        loop {
            match state.delivering {
                Some(owner) if owner == me => return,
                Some(_) => {
                    state = self
                        .idle
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                None => {
                    drop(state);
                    self.deliver();
                    state = self.lock();
                    if state.delivering.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// Hand sealed batches to `on_flush` in order. Only one caller delivers
    /// at a time; the others leave their batches to it.
    fn deliver(&self) {
        {
            let mut state = self.lock();
            if state.delivering.is_some() || state.ready.is_empty() {
                return;
            }
            state.delivering = Some(thread::current().id());
        }
        let mut guard = Delivering {
            debouncer: self,
            finished: false,
        };
        loop {
            let (record, waiters) = {
                let mut state = self.lock();
                match state.ready.pop_front() {
                    Some(batch) => batch,
                    None => {
                        // cleared under the same lock as the final pop, so
                        // no batch is left behind
                        state.delivering = None;
                        guard.finished = true;
                        drop(state);
                        self.idle.notify_all();
                        return;
                    }
                }
            };
            (self.on_flush)(record);
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}
