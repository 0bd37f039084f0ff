//! A [`Scheduler`] backed by one std thread per task.

use crate::hal::{DeferredTask, Scheduler, TaskHandle};
use alloc::{boxed::Box, sync::Arc};
use core::time::Duration;
use log::trace;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

enum Slot {
    Pending,
    Cancelled,
    Started,
}

struct Shared {
    slot: Mutex<Slot>,
    cancelled: Condvar,
}

/// Runs each deferred task on its own thread once its delay has passed.
#[derive(Clone, Debug, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: DeferredTask) -> Box<dyn TaskHandle> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            cancelled: Condvar::new(),
        });
        let timer = shared.clone();
        thread::spawn(move || {
            let slot = timer.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let (mut slot, _) = timer
                .cancelled
                .wait_timeout_while(slot, delay, |slot| matches!(slot, Slot::Pending))
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(*slot, Slot::Pending) {
                *slot = Slot::Started;
                drop(slot);
                trace!("Deferred task fired after {:?}", delay);
                task();
            }
        });
        Box::new(ThreadTask { shared })
    }
}

struct ThreadTask {
    shared: Arc<Shared>,
}

impl TaskHandle for ThreadTask {
    fn cancel(&self) -> bool {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Slot::Pending => {
                *slot = Slot::Cancelled;
                self.shared.cancelled.notify_all();
                true
            }
            Slot::Cancelled => true,
            Slot::Started => false,
        }
    }
}
