//! Trailing-edge debounce timer.
//!
//! A [`Debouncer`] is owned by the task that acts on it. Every [`Debouncer::call`]
//! replaces the stored argument and pushes the deadline out by one window;
//! [`Debouncer::expired`] yields the latest argument once the window passes quietly.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Quiet period used by the funnel report queue unless configured otherwise.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    latest: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            latest: None,
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_armed(&self) -> bool {
        self.latest.is_some()
    }

    /// Re-arms the timer with `arg`. Returns the argument it supersedes, if any,
    /// so the caller can account for it.
    pub fn call(&mut self, arg: T) -> Option<T> {
        self.deadline = Some(Instant::now() + self.window);
        self.latest.replace(arg)
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.deadline = None;
        self.latest.take()
    }

    /// Waits out the current window and hands back the latest argument.
    ///
    /// Never resolves while disarmed. Dropping the future before the deadline
    /// leaves the timer armed.
    pub async fn expired(&mut self) -> T {
        let Some(deadline) = self.deadline else {
            return std::future::pending().await;
        };
        sleep_until(deadline).await;

        self.deadline = None;
        match self.latest.take() {
            Some(arg) => arg,
            None => std::future::pending().await,
        }
    }
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}
