//! The event core.
//!
//! A single dispatcher task drives every callback in the stack: readiness
//! callbacks fire when their [`Interest`] reports readable, timer callbacks
//! fire on the deadline they returned from their previous run. Callbacks
//! execute strictly one at a time, so they never need to lock against each
//! other; registration, suspend, resume and delete are callable from any
//! thread and are serialised against dispatch by the registry lock.
//!
//! A callback returns `Some(duration)` to be fired again that much later,
//! or `None` to stay dormant until its readiness handle (if any) wakes it.

use crate::{error::Error, net::Interest};

use std::{
    sync::Arc,
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};

/// Invoke the callback once immediately upon registration, irrespective of
/// readiness. Mandatory for timer-only callbacks, which would otherwise
/// never obtain a deadline.
pub const INVOKE_IMMEDIATELY: u8 = 0x01;

/// Start in the suspended state; the callback stays dormant until resumed.
pub const SUSPEND: u8 = 0x10;

/// Strictly positive; 0 is reserved to mean "none".
pub type CallbackId = u32;

pub type Callback = Box<dyn FnMut() -> Option<Duration> + Send>;

struct FdWatch {
    rearm: Notify,
    retire: Notify,
}

struct Entry {
    /// Taken out while the dispatcher runs the callback.
    callback: Option<Callback>,
    watch: Option<Arc<FdWatch>>,
    deadline: Option<Instant>,
    ready: bool,
    suspended: bool,
    /// Deleted mid-dispatch; reaped when the run completes.
    dying: bool,
    /// Registration order, the tie-break for coinciding deadlines.
    seq: u64,
}

struct Registry {
    next_id: CallbackId,
    next_seq: u64,
    entries: HashMap<CallbackId, Entry>,
    closed: bool,
}

struct Shared {
    registry: Mutex<Registry>,
    wake: Notify,
}

#[derive(Clone)]
pub struct EventCore {
    shared: Arc<Shared>,
    handle: tokio::runtime::Handle,
}

impl EventCore {
    /// Spawn the dispatcher onto the runtime and hand back the shared
    /// registration handle.
    pub fn start(handle: tokio::runtime::Handle) -> Self {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                next_id: 1,
                next_seq: 0,
                entries: HashMap::new(),
                closed: false,
            }),
            wake: Notify::new(),
        });

        handle.spawn(dispatch(shared.clone()));

        Self { shared, handle }
    }

    /// Register a callback.
    ///
    /// With an [`Interest`] the callback fires whenever the interest
    /// reports readable; without one it is a pure timer and must pass
    /// [`INVOKE_IMMEDIATELY`] to obtain its first deadline.
    pub fn register(
        &self,
        interest: Option<Interest>,
        flags: u8,
        callback: impl FnMut() -> Option<Duration> + Send + 'static,
    ) -> Result<CallbackId, Error> {
        if interest.is_none() && flags & INVOKE_IMMEDIATELY == 0 {
            return Err(Error::EventCore);
        }

        let mut registry = self.shared.registry.lock();
        if registry.closed {
            return Err(Error::EventCore);
        }

        let id = registry.alloc_id();
        let seq = registry.next_seq;
        registry.next_seq += 1;

        let watch = interest.as_ref().map(|_| {
            Arc::new(FdWatch {
                rearm: Notify::new(),
                retire: Notify::new(),
            })
        });

        registry.entries.insert(
            id,
            Entry {
                callback: Some(Box::new(callback)),
                watch: watch.clone(),
                deadline: None,
                ready: flags & INVOKE_IMMEDIATELY != 0,
                suspended: flags & SUSPEND != 0,
                dying: false,
                seq,
            },
        );
        drop(registry);

        if let (Some(interest), Some(watch)) = (interest, watch) {
            self.handle
                .spawn(watcher(self.shared.clone(), id, interest, watch));
        }

        self.shared.wake.notify_one();
        Ok(id)
    }

    /// A suspended callback never fires, even if its deadline elapses or
    /// its readiness handle reports readable meanwhile.
    pub fn suspend(&self, id: CallbackId) -> Result<(), Error> {
        let mut registry = self.shared.registry.lock();
        let entry = registry.entries.get_mut(&id).ok_or(Error::EventCore)?;
        entry.suspended = true;
        Ok(())
    }

    pub fn resume(&self, id: CallbackId) -> Result<(), Error> {
        {
            let mut registry = self.shared.registry.lock();
            let entry = registry.entries.get_mut(&id).ok_or(Error::EventCore)?;
            entry.suspended = false;
        }

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Release the identifier. A pending-but-undispatched firing is
    /// cancelled; re-use of the identifier is permitted afterwards.
    pub fn delete(&self, id: CallbackId) -> Result<(), Error> {
        let watch = {
            let mut registry = self.shared.registry.lock();

            let busy = {
                let entry = registry.entries.get_mut(&id).ok_or(Error::EventCore)?;
                if entry.callback.is_none() {
                    // Mid-dispatch; the dispatcher reaps it on completion.
                    entry.dying = true;
                    true
                } else {
                    false
                }
            };

            if busy {
                registry.entries.get(&id).and_then(|entry| entry.watch.clone())
            } else {
                registry.entries.remove(&id).and_then(|entry| entry.watch)
            }
        };

        if let Some(watch) = watch {
            watch.retire.notify_one();
        }

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop dispatching and drop every registered callback.
    pub fn stop(&self) {
        let watches: Vec<_> = {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            registry
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.watch)
                .collect()
        };

        for watch in watches {
            watch.retire.notify_one();
        }

        self.shared.wake.notify_one();
    }
}

impl Registry {
    fn alloc_id(&mut self) -> CallbackId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Pick the next runnable entry and check its callback out. Pending
    /// readiness runs before expired timers; ties observe registration
    /// order.
    fn checkout(&mut self, now: Instant) -> Option<(CallbackId, Callback, bool)> {
        let mut best: Option<(CallbackId, bool, (u8, Instant, u64))> = None;

        for (id, entry) in self.entries.iter() {
            if entry.suspended || entry.dying || entry.callback.is_none() {
                continue;
            }

            let key = if entry.ready {
                (0u8, now, entry.seq)
            } else if let Some(deadline) = entry.deadline {
                if deadline > now {
                    continue;
                }
                (1u8, deadline, entry.seq)
            } else {
                continue;
            };

            if best.as_ref().map(|(_, _, k)| key < *k).unwrap_or(true) {
                best = Some((*id, entry.ready, key));
            }
        }

        let (id, was_ready, _) = best?;
        let entry = self.entries.get_mut(&id)?;
        let callback = entry.callback.take()?;
        Some((id, callback, was_ready))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| !entry.suspended && !entry.dying && entry.callback.is_some())
            .filter_map(|entry| entry.deadline)
            .min()
    }
}

async fn dispatch(shared: Arc<Shared>) {
    loop {
        // Drain everything runnable, one callback at a time and with the
        // registry unlocked around each run.
        loop {
            let now = Instant::now();
            let job = {
                let mut registry = shared.registry.lock();
                if registry.closed {
                    return;
                }
                registry.checkout(now)
            };

            let Some((id, mut callback, was_ready)) = job else {
                break;
            };

            let next = callback();

            enum Outcome {
                Gone,
                Dying,
                Live(Option<Arc<FdWatch>>),
            }

            let (rearm, retire) = {
                let mut registry = shared.registry.lock();

                let outcome = match registry.entries.get_mut(&id) {
                    None => Outcome::Gone,
                    Some(entry) if entry.dying => Outcome::Dying,
                    Some(entry) => {
                        entry.callback = Some(callback);
                        entry.deadline = next.map(|after| Instant::now() + after);
                        if was_ready {
                            entry.ready = false;
                            Outcome::Live(entry.watch.clone())
                        } else {
                            Outcome::Live(None)
                        }
                    }
                };

                match outcome {
                    Outcome::Gone => (None, None),
                    Outcome::Dying => {
                        (None, registry.entries.remove(&id).and_then(|entry| entry.watch))
                    }
                    Outcome::Live(watch) => (watch, None),
                }
            };

            if let Some(watch) = rearm {
                watch.rearm.notify_one();
            }
            if let Some(watch) = retire {
                watch.retire.notify_one();
            }
        }

        let wake = shared.wake.notified();
        tokio::pin!(wake);

        let deadline = {
            let registry = shared.registry.lock();
            if registry.closed {
                return;
            }
            registry.next_deadline()
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = &mut wake => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => wake.await,
        }
    }
}

async fn watcher(shared: Arc<Shared>, id: CallbackId, interest: Interest, watch: Arc<FdWatch>) {
    loop {
        tokio::select! {
            _ = interest.readable() => {}
            _ = watch.retire.notified() => return,
        }

        {
            let mut registry = shared.registry.lock();
            match registry.entries.get_mut(&id) {
                Some(entry) if !entry.dying => entry.ready = true,
                _ => return,
            }
        }
        shared.wake.notify_one();

        tokio::select! {
            _ = watch.rearm.notified() => {}
            _ = watch.retire.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    fn core() -> EventCore {
        EventCore::start(tokio::runtime::Handle::current())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_rearms_until_sentinel() {
        let core = core();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        core.register(None, INVOKE_IMMEDIATELY, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (n < 3).then_some(Duration::from_millis(5))
        })
        .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_only_registration_requires_immediate_invoke() {
        let core = core();
        assert_eq!(
            core.register(None, 0, || None).err(),
            Some(Error::EventCore)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspended_callback_never_fires() {
        let core = core();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let id = core
            .register(None, INVOKE_IMMEDIATELY | SUSPEND, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
            .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        core.resume(id).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_cancels_pending_dispatch() {
        let core = core();
        let fired = Arc::new(AtomicUsize::new(0));

        // Suspended with an already-elapsed deadline: deleting it before a
        // resume must prevent the dispatch entirely.
        let counter = fired.clone();
        let id = core
            .register(None, INVOKE_IMMEDIATELY | SUSPEND, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        core.delete(id).unwrap();
        assert_eq!(core.resume(id).err(), Some(Error::EventCore));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readiness_drives_fd_callback() {
        let core = core();
        let (a, b) = crate::net::Pair::pair();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let reader = b.clone();
        core.register(Some(b.readiness()), 0, move || {
            let mut buf = [0u8; 16];
            while reader.try_read(&mut buf).is_ok_and(|n| n > 0) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            None
        })
        .unwrap();

        a.try_write(b"one").unwrap();
        sleep(Duration::from_millis(100)).await;
        a.try_write(b"two").unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coinciding_deadlines_fire_in_registration_order() {
        let core = core();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the dispatcher busy so all three deadlines coincide before
        // any of them is dispatched.
        core.register(None, INVOKE_IMMEDIATELY, move || {
            std::thread::sleep(Duration::from_millis(200));
            None
        })
        .unwrap();

        let mut ids = Vec::new();
        for tag in 0..3 {
            let order = order.clone();
            ids.push(
                core.register(None, INVOKE_IMMEDIATELY | SUSPEND, move || {
                    order.lock().push(tag);
                    None
                })
                .unwrap(),
            );
        }

        sleep(Duration::from_millis(50)).await;
        for index in [2, 0, 1] {
            core.resume(ids[index]).unwrap();
        }

        sleep(Duration::from_millis(300)).await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
