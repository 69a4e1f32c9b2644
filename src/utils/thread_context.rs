use std::thread::{sleep, JoinHandle};
use std::time::Duration;

use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::utils::threads::spawn_named_thread;

const STOP_POLL_ATTEMPTS: u16 = 10;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A worker definition: a name and a callback that runs on its own thread
/// and observes a cancellation channel to know when to wind down.
pub struct NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    thread_name: String,
    callback: F,
}

impl<F> NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    pub fn new<S: Into<String>>(thread_name: S, callback: F) -> Self {
        Self {
            thread_name: thread_name.into(),
            callback,
        }
    }

    pub fn start(self) -> StartedThreadContext {
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();
        let join_handle = spawn_named_thread(&self.thread_name, move || {
            (self.callback)(stop_consumer);
        });

        StartedThreadContext {
            thread_name: self.thread_name,
            stop_publisher,
            join_handle,
        }
    }
}

/// Handle over a running worker thread: owns the cancellation publisher and
/// the join handle.
pub struct StartedThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadStopError {
    #[error("error sending stop signal to '{0}' thread: {1}")]
    StopSignal(String, String),

    #[error("'{0}' thread panicked")]
    Join(String),

    #[error("timeout waiting for '{0}' thread to finish")]
    StopTimeout(String),
}

impl StartedThreadContext {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Sends the stop signal and polls for completion, giving up after one
    /// second so a wedged worker cannot block its owner forever.
    pub fn stop(self) -> Result<(), ThreadStopError> {
        self.signal_stop()?;
        for _ in 0..STOP_POLL_ATTEMPTS {
            if self.join_handle.is_finished() {
                return self.join();
            }
            sleep(STOP_POLL_INTERVAL);
        }
        Err(ThreadStopError::StopTimeout(self.thread_name))
    }

    /// Sends the stop signal and waits for the thread to finish.
    pub fn stop_blocking(self) -> Result<(), ThreadStopError> {
        self.signal_stop()?;
        self.join()
    }

    fn signal_stop(&self) -> Result<(), ThreadStopError> {
        self.stop_publisher.publish(()).map_err(|err| {
            ThreadStopError::StopSignal(self.thread_name.clone(), err.to_string())
        })
    }

    fn join(self) -> Result<(), ThreadStopError> {
        self.join_handle
            .join()
            .map_err(|_| ThreadStopError::Join(self.thread_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looping_worker(stop_consumer: EventConsumer<CancellationMessage>) {
        loop {
            if stop_consumer.is_cancelled(Duration::from_millis(1)) {
                break;
            }
        }
    }

    #[test]
    fn start_and_stop_blocking() {
        let started = NotStartedThreadContext::new("worker", looping_worker).start();
        assert!(!started.is_finished());
        started.stop_blocking().unwrap();
    }

    #[test]
    fn start_and_stop_with_deadline() {
        let started = NotStartedThreadContext::new("worker", looping_worker).start();
        assert_eq!(started.thread_name(), "worker");
        started.stop().unwrap();
    }

    #[test]
    fn stop_times_out_on_wedged_worker() {
        let started = NotStartedThreadContext::new("wedged", |_stop| {
            sleep(Duration::from_secs(u64::MAX));
        })
        .start();

        assert_eq!(
            started.stop().unwrap_err(),
            ThreadStopError::StopTimeout("wedged".to_string())
        );
    }
}
