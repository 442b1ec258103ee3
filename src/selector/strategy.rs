use log::trace;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::executor::{job, Executor, Rejected};
use crate::selector::producer::SelectorProducer;

/// "Eat what you kill": the thread that discovers readiness runs the
/// resulting work itself, after handing the producer role to another
/// thread. The mutex around the producer is the at-most-one-producer
/// guarantee.
pub(crate) struct ExecuteProduceConsume {
    producer: Mutex<SelectorProducer>,
    executor: Arc<dyn Executor>,
}

impl ExecuteProduceConsume {
    pub(crate) fn new(producer: SelectorProducer, executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            producer: Mutex::new(producer),
            executor,
        })
    }

    /// Produce on the current thread until the selector stops or production
    /// is handed off. Either a task is yielded or the producer parks in the
    /// OS wait; it is never idle.
    pub(crate) fn produce(self: Arc<Self>) {
        loop {
            let task = self.producer.lock().produce();
            let Some(task) = task else {
                trace!("producer exhausted");
                return;
            };
            let takeover = {
                let strategy = Arc::clone(&self);
                job(move || strategy.produce())
            };
            match self.executor.execute(takeover) {
                Ok(()) => {
                    // Another thread produces now; eat what we killed.
                    task.run();
                    return;
                }
                Err(Rejected(_)) => {
                    // Saturated: run the task here and remain the producer.
                    task.run();
                }
            }
        }
    }
}
