use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A lock acquisition gave up before its deadline.
///
/// The caller does not hold the lock and must not touch the protected
/// resource. The lock itself remains usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for the log lock")]
pub struct LockTimeout;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer_active: bool,
    writers_waiting: usize,
}

/// A reader/writer lock with writer preference.
///
/// Any number of readers may hold the lock at once; a writer holds it
/// exclusively. Once a writer starts waiting, readers arriving after it
/// block until that writer has acquired and released the lock, so a steady
/// stream of readers cannot starve the writer. Readers that already hold
/// the lock finish normally.
///
/// Acquisition returns an RAII guard; dropping the guard releases the lock
/// exactly once, including on panic paths.
#[derive(Debug, Default)]
pub struct ReaderWriterLock {
    state: Mutex<LockState>,
    readers_turn: Condvar,
    writers_turn: Condvar,
}

impl ReaderWriterLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the read side, waiting at most `timeout` (forever if `None`).
    pub fn read(&self, timeout: Option<Duration>) -> Result<ReadGuard<'_>, LockTimeout> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock_state(&self.state);
        while state.writer_active || state.writers_waiting > 0 {
            let (next, timed_out) = wait_turn(&self.readers_turn, state, deadline);
            state = next;
            if timed_out && (state.writer_active || state.writers_waiting > 0) {
                return Err(LockTimeout);
            }
        }
        state.readers += 1;
        Ok(ReadGuard { lock: self })
    }

    /// Acquire the write side, waiting at most `timeout` (forever if `None`).
    pub fn write(&self, timeout: Option<Duration>) -> Result<WriteGuard<'_>, LockTimeout> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock_state(&self.state);
        state.writers_waiting += 1;
        while state.readers > 0 || state.writer_active {
            let (next, timed_out) = wait_turn(&self.writers_turn, state, deadline);
            state = next;
            if timed_out && (state.readers > 0 || state.writer_active) {
                state.writers_waiting -= 1;
                if state.writers_waiting == 0 {
                    // Readers held back by our presence in the queue may go.
                    self.readers_turn.notify_all();
                }
                return Err(LockTimeout);
            }
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
        Ok(WriteGuard { lock: self })
    }
}

/// Shared read access; dropping releases the read side.
#[must_use]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ReaderWriterLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_state(&self.lock.state);
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.writers_turn.notify_one();
        }
    }
}

/// Exclusive write access; dropping releases the write side.
#[must_use]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ReaderWriterLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_state(&self.lock.state);
        state.writer_active = false;
        self.lock.writers_turn.notify_one();
        self.lock.readers_turn.notify_all();
    }
}

fn lock_state(state: &Mutex<LockState>) -> MutexGuard<'_, LockState> {
    // A panicking guard holder has already released via Drop; the counters
    // stay consistent, so poisoning carries no extra information here.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `turn` until notified or the deadline passes. The returned flag
/// reports deadline expiry; the caller re-checks its predicate either way,
/// so spurious wakeups and early timeouts are both harmless.
fn wait_turn<'a>(
    turn: &Condvar,
    state: MutexGuard<'a, LockState>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, LockState>, bool) {
    match deadline {
        None => (
            turn.wait(state).unwrap_or_else(PoisonError::into_inner),
            false,
        ),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (state, true);
            }
            let (state, result) = turn
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            (state, result.timed_out())
        }
    }
}
