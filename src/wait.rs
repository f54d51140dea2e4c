use std::panic::{self, AssertUnwindSafe};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::buffer::Buffering;
use crate::config::HarnessConfig;

/// Delay between two snapshots unless configured otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The expected strings did not all show up, in order, before the deadline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Waited {:.2}secs but {:?} did not appear in output in the given order !",
    .timeout.as_secs_f64(),
    .targets
)]
pub struct WaitTimeout {
    pub timeout: Duration,
    pub targets: Vec<String>,
}

/// Polls accumulated output until a sequence of strings has appeared in order.
///
/// Each poll sleeps for the interval, takes a fresh snapshot of the whole output and
/// scans it from the first line, so earlier matches never need to be remembered. The number
/// of polls is `timeout / poll_interval`.
#[derive(Debug, Clone)]
pub struct Waiter {
    poll_interval: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Waiter {
    /// Creates a waiter polling every `poll_interval`.
    ///
    /// # Arguments
    /// * `poll_interval` - Sleep before each snapshot, at least one millisecond
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Creates a waiter using the configured poll interval
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.poll_interval)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Blocks until `targets` appear in order in what `snapshot` returns, or `timeout` passes.
    ///
    /// # Arguments
    /// * `snapshot` - Returns the whole output collected so far, called once per poll
    /// * `timeout` - Upper bound on the time spent polling
    /// * `targets` - Substrings expected in this order, see [`strings_in_order`]
    ///
    /// # Returns
    /// * `Result<(), WaitTimeout>` - The timeout error names every target
    pub fn wait<F, S, T>(&self, mut snapshot: F, timeout: Duration, targets: &[T]) -> Result<(), WaitTimeout>
    where
        F: FnMut() -> S,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        if targets.is_empty() {
            return Ok(());
        }

        for attempt in 1..=self.attempts(timeout) {
            sleep(self.poll_interval);
            if strings_in_order(snapshot().as_ref(), targets) {
                debug!("Found {} strings after {} polls", targets.len(), attempt);
                return Ok(());
            }
        }
        Err(timed_out(timeout, targets))
    }

    /// Same as [`wait`](Self::wait), sleeping on the tokio timer instead of the thread
    pub async fn wait_async<F, S, T>(
        &self,
        mut snapshot: F,
        timeout: Duration,
        targets: &[T],
    ) -> Result<(), WaitTimeout>
    where
        F: FnMut() -> S,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        if targets.is_empty() {
            return Ok(());
        }

        for attempt in 1..=self.attempts(timeout) {
            tokio::time::sleep(self.poll_interval).await;
            if strings_in_order(snapshot().as_ref(), targets) {
                debug!("Found {} strings after {} polls", targets.len(), attempt);
                return Ok(());
            }
        }
        Err(timed_out(timeout, targets))
    }

    /// Waits on the output of a process, socket or reader
    pub fn wait_for<B, T>(&self, source: &mut B, timeout: Duration, targets: &[T]) -> Result<(), WaitTimeout>
    where
        B: Buffering + ?Sized,
        T: AsRef<str>,
    {
        self.wait(|| source.read().to_owned(), timeout, targets)
    }

    fn attempts(&self, timeout: Duration) -> u128 {
        timeout.as_nanos() / self.poll_interval.as_nanos()
    }
}

/// Waits with the default poll interval, see [`Waiter::wait`]
pub fn wait_for_strings<F, S, T>(snapshot: F, timeout: Duration, targets: &[T]) -> Result<(), WaitTimeout>
where
    F: FnMut() -> S,
    S: AsRef<str>,
    T: AsRef<str>,
{
    Waiter::default().wait(snapshot, timeout, targets)
}

/// Panicking form of [`wait_for_strings`] for test bodies
#[track_caller]
pub fn assert_strings_in_order<F, S, T>(snapshot: F, timeout: Duration, targets: &[T])
where
    F: FnMut() -> S,
    S: AsRef<str>,
    T: AsRef<str>,
{
    if let Err(e) = wait_for_strings(snapshot, timeout, targets) {
        panic!("{}", e);
    }
}

/// True when every target occurs in `text` in the given order.
///
/// Targets are plain substrings. Several may be found on the same line, left to right, and
/// consecutive targets may be separated by any number of lines. A target is only looked up
/// after the end of the previous match on the same line.
///
/// # Arguments
/// * `text` - The output to scan. Lines end at `\n`, `\r`, vertical tab, form feed, the
///   ASCII file/group/record separators and the unicode line and paragraph separators
/// * `targets` - The substrings to find, in order
///
/// # Examples
/// ```
/// use proctest::strings_in_order;
///
/// assert!(strings_in_order("xA y\nzB", &["A", "B"]));
/// assert!(strings_in_order("ABfoo", &["A", "B"]));
/// assert!(!strings_in_order("B then A", &["A", "B"]));
/// ```
pub fn strings_in_order<T: AsRef<str>>(text: &str, targets: &[T]) -> bool {
    // Next expected target last
    let mut remaining: Vec<&str> = targets.iter().rev().map(AsRef::as_ref).collect();
    for line in text.split(is_line_boundary) {
        let mut pos = 0;
        while let Some(next) = remaining.last() {
            match line[pos..].find(*next) {
                Some(offset) => {
                    pos += offset + next.len();
                    remaining.pop();
                }
                None => break,
            }
        }
        if remaining.is_empty() {
            return true;
        }
    }
    remaining.is_empty()
}

fn is_line_boundary(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Runs `body`, printing the output of `source` to stderr if it fails or panics.
///
/// The error is returned and the panic resumed unchanged after the dump.
pub fn dump_on_error<B, T, E, F>(source: &mut B, body: F) -> Result<T, E>
where
    B: Buffering + ?Sized,
    F: FnOnce(&mut B) -> Result<T, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(&mut *source))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            dump_output(source.read());
            Err(e)
        }
        Err(payload) => {
            dump_output(source.read());
            panic::resume_unwind(payload)
        }
    }
}

fn dump_output(output: &str) {
    eprintln!("*********** OUTPUT ***********");
    eprintln!("{}", output);
    eprintln!("******************************");
}

fn timed_out<T: AsRef<str>>(timeout: Duration, targets: &[T]) -> WaitTimeout {
    WaitTimeout {
        timeout,
        targets: targets.iter().map(|t| t.as_ref().to_owned()).collect(),
    }
}
