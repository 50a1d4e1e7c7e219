use crate::protocol::Command;
use crate::time::GoEpoch;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampedCommand {
    /// Seconds since the go epoch.
    pub timestamp: f64,
    pub command: Command,
}

/// What a blocking receive produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    Command(TimestampedCommand),
    /// Nothing arrived within the queue timeout.
    Timeout,
    /// Shutdown sentinel, or every producer is gone.
    Shutdown,
}

#[derive(Debug)]
enum Envelope {
    Command(TimestampedCommand),
    Shutdown,
}

/// FIFO of timestamped commands shared between the link reader and the
/// dispatcher.
#[derive(Debug)]
pub struct CommandQueue {
    sender: Sender<Envelope>,
    receiver: Receiver<Envelope>,
    get_timeout: Duration,
    go_epoch: OnceLock<GoEpoch>,
    created_at: Instant,
}

impl CommandQueue {
    pub fn new(get_timeout: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            get_timeout,
            go_epoch: OnceLock::new(),
            created_at: Instant::now(),
        }
    }

    pub fn get_timeout(&self) -> Duration {
        self.get_timeout
    }

    /// Sets the reference used for implicit timestamps. Only the first call
    /// takes effect.
    pub fn set_go_epoch(&self, epoch: GoEpoch) {
        if self.go_epoch.set(epoch).is_err() {
            warn!("Go epoch is already set for this run, ignoring the new value");
        }
    }

    pub fn go_epoch(&self) -> Option<GoEpoch> {
        self.go_epoch.get().copied()
    }

    /// Seconds since the go epoch, or since queue creation before the go
    /// command.
    pub fn current_relative_timestamp(&self) -> f64 {
        match self.go_epoch.get() {
            Some(epoch) => epoch.elapsed(),
            None => self.created_at.elapsed().as_secs_f64(),
        }
    }

    pub fn put(&self, command: Command, timestamp: Option<f64>) {
        let timestamp = timestamp.unwrap_or_else(|| self.current_relative_timestamp());
        // The queue owns a receiver, so the channel cannot be disconnected.
        let _ = self
            .sender
            .send(Envelope::Command(TimestampedCommand { timestamp, command }));
    }

    pub(crate) fn put_shutdown(&self) {
        let _ = self.sender.send(Envelope::Shutdown);
    }

    /// Blocks until a command is available or the timeout elapses.
    pub fn get(&self) -> Option<TimestampedCommand> {
        match self.recv() {
            Delivery::Command(item) => Some(item),
            Delivery::Timeout => {
                error!(
                    "Command queue could not get an item in given timeout of {:.3} seconds",
                    self.get_timeout.as_secs_f64()
                );
                None
            }
            Delivery::Shutdown => {
                debug!("Command queue received the shutdown sentinel");
                None
            }
        }
    }

    pub(crate) fn recv(&self) -> Delivery {
        match self.receiver.recv_timeout(self.get_timeout) {
            Ok(Envelope::Command(item)) => Delivery::Command(item),
            Ok(Envelope::Shutdown) => Delivery::Shutdown,
            Err(RecvTimeoutError::Timeout) => Delivery::Timeout,
            Err(RecvTimeoutError::Disconnected) => Delivery::Shutdown,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_times_out_without_items() {
        let queue = CommandQueue::new(Duration::from_millis(50));
        let started = Instant::now();
        assert_eq!(queue.get(), None);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_fifo_order_is_arrival_order() {
        let queue = CommandQueue::new(Duration::from_millis(50));
        queue.put(Command::Distance(30), Some(2.0));
        queue.put(Command::Distance(20), Some(1.0));
        queue.put(Command::End, Some(0.5));

        assert_eq!(queue.get().map(|c| c.command), Some(Command::Distance(30)));
        assert_eq!(queue.get().map(|c| c.command), Some(Command::Distance(20)));
        assert_eq!(queue.get().map(|c| c.timestamp), Some(0.5));
    }

    #[test]
    fn test_implicit_timestamp_uses_go_epoch() {
        let queue = CommandQueue::new(Duration::from_millis(50));
        let epoch = GoEpoch::new(Instant::now() - Duration::from_secs(10));
        queue.set_go_epoch(epoch);
        // Second epoch is ignored.
        queue.set_go_epoch(GoEpoch::now());

        queue.put(Command::Press(4), None);
        let item = queue.get().expect("queued command");
        assert!(item.timestamp >= 10.0);
        assert!(item.timestamp < 12.0);
    }

    #[test]
    fn test_shutdown_sentinel_is_not_a_command() {
        let queue = CommandQueue::new(Duration::from_secs(5));
        queue.put_shutdown();
        assert_eq!(queue.recv(), Delivery::Shutdown);
    }
}
