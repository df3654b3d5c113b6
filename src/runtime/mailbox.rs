use super::executor::Executor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered queue in front of one handler.
///
/// At most one drain job per mailbox runs on the executor, so items reach
/// the handler in the order they were delivered. A panicking handler loses
/// only the item it panicked on.
pub struct Mailbox<T> {
    handler: Handler<T>,
    items: Mutex<VecDeque<T>>,
    scheduled: AtomicBool,
}

impl<T: Send + 'static> Mailbox<T> {
    pub fn new(handler: Handler<T>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            items: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
        })
    }

    pub fn handles(&self, handler: &Handler<T>) -> bool {
        Arc::ptr_eq(&self.handler, handler)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deliver(self: &Arc<Self>, item: T, executor: &Executor) {
        self.items.lock().push_back(item);
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mailbox = Arc::clone(self);
        if executor.spawn(move || mailbox.drain()).is_err() {
            self.scheduled.store(false, Ordering::Release);
        }
    }

    fn drain(&self) {
        loop {
            let next = self.items.lock().pop_front();
            match next {
                Some(item) => {
                    let handler = &self.handler;
                    if catch_unwind(AssertUnwindSafe(|| handler(&item))).is_err() {
                        error!("Mailbox handler panicked; item dropped");
                    }
                }
                None => {
                    self.scheduled.store(false, Ordering::Release);
                    // An item may have landed between the pop and the store
                    if self.items.lock().is_empty()
                        || self
                            .scheduled
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn preserves_order_and_survives_panics() {
        let executor = Executor::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let ordered = Mailbox::new(Arc::new(move |n: &u32| {
            tx.lock().send(*n).unwrap();
        }) as Handler<u32>);
        let panicky = Mailbox::new(Arc::new(|_: &u32| panic!("handler bug")) as Handler<u32>);

        for n in 0..100 {
            panicky.deliver(n, &executor);
            ordered.deliver(n, &executor);
        }

        let received: Vec<u32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
