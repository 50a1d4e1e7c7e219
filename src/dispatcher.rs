use crate::protocol::Command;
use crate::queue::{CommandQueue, Delivery};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Receiver of every command drained from the queue.
pub trait CommandConsumer: Send + Sync {
    fn process_cmd(&self, timestamp: f64, command: &Command);

    /// Called when the queue timed out without a command.
    fn process_empty(&self) {}
}

/// Drains the command queue on its own thread and fans each command out to
/// the consumers in registration order.
pub struct CommandDispatcher {
    queue: Arc<CommandQueue>,
    consumers: Arc<Mutex<Vec<Arc<dyn CommandConsumer>>>>,
    worker: Option<JoinHandle<u64>>,
}

impl CommandDispatcher {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self {
            queue,
            consumers: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    pub fn add_consumer(&self, consumer: Arc<dyn CommandConsumer>) {
        self.consumers.lock().push(consumer);
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let queue = Arc::clone(&self.queue);
        let consumers = Arc::clone(&self.consumers);
        let handle = thread::Builder::new()
            .name("command-dispatcher".into())
            .spawn(move || dispatch_loop(&queue, &consumers))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Wakes the thread with the shutdown sentinel and joins it. Returns the
    /// number of commands dispatched.
    pub fn stop(&mut self) -> u64 {
        let Some(handle) = self.worker.take() else {
            return 0;
        };
        self.queue.put_shutdown();
        match handle.join() {
            Ok(dispatched) => dispatched,
            Err(_) => {
                error!("Command dispatcher thread panicked");
                0
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(queue: &CommandQueue, consumers: &Mutex<Vec<Arc<dyn CommandConsumer>>>) -> u64 {
    debug!("Command dispatcher has begun");
    let mut dispatched = 0;
    loop {
        match queue.recv() {
            Delivery::Command(item) => {
                trace!("Dispatching {} at {:.3}", item.command, item.timestamp);
                let consumers = consumers.lock().clone();
                for consumer in &consumers {
                    consumer.process_cmd(item.timestamp, &item.command);
                }
                dispatched += 1;
            }
            Delivery::Timeout => {
                let consumers = consumers.lock().clone();
                for consumer in &consumers {
                    consumer.process_empty();
                }
            }
            Delivery::Shutdown => break,
        }
    }
    debug!("Command dispatcher exits after {} commands", dispatched);
    dispatched
}
