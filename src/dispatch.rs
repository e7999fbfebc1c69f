//! Delivery of forwarded updates to subscriber callbacks.
//!
//! Every subscription gets a [`Mailbox`] pinned to one worker thread, which
//! keeps deliveries for a subscription in enqueue order. The ingestion path
//! only pushes into mailboxes; callbacks always run on worker threads.
//!
//! - Regular mailboxes are bounded; on overflow the oldest pending update
//!   is discarded and counted.
//! - RT mailboxes hold a single slot on a separate worker pool; a newer
//!   update replaces one not yet delivered.
//!
//! A panicking callback is caught and counted; the worker carries on.
//!
//! Closing a mailbox from a worker thread (a callback unsubscribing some
//! subscription) does not wait for a callback of that mailbox already
//! running on another worker; that one invocation may still finish.
//! Waiting there could leave two workers blocked on each other.

use crate::error::{CanError, Result};
use crate::subscriptions::{Delivery, Handler, SubscriptionStats};
use crate::types::{SubscriptionId, Update};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

thread_local! {
    /// Set on dispatch worker threads.
    static ON_WORKER: Cell<bool> = Cell::new(false);
}

/// Pending deliveries of one subscription.
pub struct Mailbox {
    id: SubscriptionId,
    handler: Handler,
    delivery: Delivery,
    capacity: usize,
    lane: usize,
    pending: Mutex<VecDeque<Arc<Update>>>,
    /// True while the mailbox sits in its worker's run queue.
    scheduled: AtomicBool,
    /// Held for the whole callback invocation.
    gate: Mutex<()>,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    panics: AtomicU64,
}

impl Mailbox {
    pub fn new(
        id: SubscriptionId,
        handler: Handler,
        delivery: Delivery,
        capacity: usize,
        lane: usize,
    ) -> Self {
        let capacity = match delivery {
            Delivery::Queued => capacity.max(1),
            Delivery::RealTime => 1,
        };
        Self {
            id,
            handler,
            delivery,
            capacity,
            lane,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            scheduled: AtomicBool::new(false),
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an update. Returns true if the mailbox must be scheduled.
    fn push(&self, update: Arc<Update>) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            pending.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(subscription = %self.id, dropped, "mailbox full, dropped oldest");
        }
        pending.push_back(update);
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Deliver everything pending, then leave the run queue.
    fn drain(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock();
                match pending.pop_front() {
                    Some(update) => update,
                    None => {
                        // Cleared under the lock so a concurrent push reschedules.
                        self.scheduled.store(false, Ordering::Release);
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, update: &Update) {
        let _gate = self.gate.lock();
        if self.is_closed() {
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.invoke(update))) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %self.id, key = %update.key, "subscriber callback panicked");
            }
        }
    }

    /// Stop all further deliveries.
    ///
    /// Outside the dispatch workers this waits for a callback in progress,
    /// so once it returns the callback is not invoked again. On a worker
    /// it returns at once and only a callback already running elsewhere
    /// may still complete.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        if !ON_WORKER.with(|w| w.get()) {
            drop(self.gate.lock());
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            callback_panics: self.panics.load(Ordering::Relaxed),
            pending: self.pending.lock().len(),
        }
    }
}

/// Worker pools that run subscriber callbacks.
pub struct Dispatcher {
    lanes: Vec<Sender<Arc<Mailbox>>>,
    rt_lanes: Vec<Sender<Arc<Mailbox>>>,
    workers: Vec<JoinHandle<()>>,
    mailbox_capacity: usize,
}

impl Dispatcher {
    /// Start `workers` regular and `rt_workers` RT delivery threads.
    pub fn new(workers: usize, rt_workers: usize, mailbox_capacity: usize) -> Result<Self> {
        if workers == 0 {
            return Err(CanError::InvalidArgument(
                "at least one dispatch worker is required".into(),
            ));
        }

        let mut handles = Vec::with_capacity(workers + rt_workers);
        let mut lanes = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = unbounded();
            handles.push(Self::spawn_worker(format!("can-dispatch-{}", i), rx)?);
            lanes.push(tx);
        }

        let mut rt_lanes = Vec::with_capacity(rt_workers);
        for i in 0..rt_workers {
            let (tx, rx) = unbounded();
            handles.push(Self::spawn_worker(format!("can-dispatch-rt-{}", i), rx)?);
            rt_lanes.push(tx);
        }

        Ok(Self {
            lanes,
            rt_lanes,
            workers: handles,
            mailbox_capacity,
        })
    }

    fn spawn_worker(name: String, rx: Receiver<Arc<Mailbox>>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                ON_WORKER.with(|w| w.set(true));
                for mailbox in rx.iter() {
                    mailbox.drain();
                }
            })
            .map_err(|e| CanError::Internal(format!("failed to start dispatch worker: {}", e)))
    }

    pub fn supports_real_time(&self) -> bool {
        !self.rt_lanes.is_empty()
    }

    /// Create the mailbox for a new subscription.
    pub fn open_mailbox(
        &self,
        id: SubscriptionId,
        handler: Handler,
        delivery: Delivery,
    ) -> Result<Arc<Mailbox>> {
        let lanes = match delivery {
            Delivery::Queued => &self.lanes,
            Delivery::RealTime => &self.rt_lanes,
        };
        if lanes.is_empty() {
            return Err(CanError::NotSupported(
                "real-time delivery is disabled".into(),
            ));
        }

        let lane = (id.0 % lanes.len() as u64) as usize;
        Ok(Arc::new(Mailbox::new(
            id,
            handler,
            delivery,
            self.mailbox_capacity,
            lane,
        )))
    }

    /// Queue an update for delivery. Never blocks on callbacks.
    pub fn enqueue(&self, mailbox: &Arc<Mailbox>, update: Arc<Update>) {
        if mailbox.is_closed() {
            return;
        }
        if mailbox.push(update) {
            let lanes = match mailbox.delivery {
                Delivery::Queued => &self.lanes,
                Delivery::RealTime => &self.rt_lanes,
            };
            // Lanes only disconnect while the dispatcher is being dropped.
            let _ = lanes[mailbox.lane].send(Arc::clone(mailbox));
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.lanes.clear();
        self.rt_lanes.clear();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last owner may be a callback running on a worker.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusName, FrameData, Timestamp};
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn frame(byte: u8) -> Arc<Update> {
        Arc::new(Update::frame(BusName(0), 0x100, Timestamp(byte as u64), vec![byte]))
    }

    fn channel_handler() -> (Handler, Receiver<FrameData>) {
        let (tx, rx) = bounded(1024);
        let handler = Handler::Frame(Arc::new(move |f: &FrameData| {
            let _ = tx.send(f.clone());
        }));
        (handler, rx)
    }

    #[test]
    fn test_in_order_delivery() {
        let dispatcher = Dispatcher::new(2, 0, 64).unwrap();
        let (handler, rx) = channel_handler();
        let mailbox = dispatcher
            .open_mailbox(SubscriptionId(1), handler, Delivery::Queued)
            .unwrap();

        for b in 0..20u8 {
            dispatcher.enqueue(&mailbox, frame(b));
        }

        let got: Vec<u8> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap().payload[0])
            .collect();
        assert_eq!(got, (0..20u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let dispatcher = Dispatcher::new(1, 0, 2).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (seen_tx, seen_rx) = bounded(16);
        let handler = Handler::Frame(Arc::new(move |f: &FrameData| {
            // Blocks the worker until the test lets it go.
            let _ = release_rx.recv();
            let _ = seen_tx.send(f.payload[0]);
        }));
        let mailbox = dispatcher
            .open_mailbox(SubscriptionId(1), handler, Delivery::Queued)
            .unwrap();

        dispatcher.enqueue(&mailbox, frame(0));
        // Wait until the worker has taken update 0 and is blocked in the callback.
        while mailbox.stats().pending != 0 {
            thread::yield_now();
        }
        for b in 1..=4u8 {
            dispatcher.enqueue(&mailbox, frame(b));
        }
        assert_eq!(mailbox.stats().dropped, 2);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        let got: Vec<u8> = (0..3)
            .map(|_| seen_rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(got, vec![0, 3, 4]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let dispatcher = Dispatcher::new(1, 0, 16).unwrap();
        let (tx, rx) = bounded(16);
        let handler = Handler::Frame(Arc::new(move |f: &FrameData| {
            if f.payload[0] == 1 {
                panic!("subscriber failure");
            }
            let _ = tx.send(f.payload[0]);
        }));
        let mailbox = dispatcher
            .open_mailbox(SubscriptionId(1), handler, Delivery::Queued)
            .unwrap();

        for b in 0..3u8 {
            dispatcher.enqueue(&mailbox, frame(b));
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(mailbox.stats().callback_panics, 1);
    }

    #[test]
    fn test_closed_mailbox_never_delivers() {
        let dispatcher = Dispatcher::new(1, 0, 16).unwrap();
        let (handler, rx) = channel_handler();
        let mailbox = dispatcher
            .open_mailbox(SubscriptionId(1), handler, Delivery::Queued)
            .unwrap();

        mailbox.close();
        dispatcher.enqueue(&mailbox, frame(0));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(mailbox.stats().pending, 0);
    }

    #[test]
    fn test_real_time_requires_rt_workers() {
        let dispatcher = Dispatcher::new(1, 0, 16).unwrap();
        let (handler, _rx) = channel_handler();
        let result = dispatcher.open_mailbox(SubscriptionId(1), handler, Delivery::RealTime);
        assert!(matches!(result, Err(CanError::NotSupported(_))));
        assert!(!dispatcher.supports_real_time());
    }

    #[test]
    fn test_real_time_single_slot() {
        let dispatcher = Dispatcher::new(1, 1, 16).unwrap();
        let (handler, _rx) = channel_handler();
        let mailbox = dispatcher
            .open_mailbox(SubscriptionId(1), handler, Delivery::RealTime)
            .unwrap();
        assert_eq!(mailbox.capacity, 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Dispatcher::new(0, 1, 16).is_err());
    }
}
