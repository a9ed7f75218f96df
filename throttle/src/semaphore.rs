use std::sync::{Condvar, Mutex};

/// A blocking counting semaphore.
///
/// Unlike `tokio::sync::Semaphore`, `acquire` parks the calling OS thread
/// rather than yielding to an async executor - this is what the parallel
/// transfer pool's worker threads need since they do blocking I/O directly.
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    /// `None` means unlimited (throttle disabled).
    permits: Option<usize>,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { permits: None }),
            available: Condvar::new(),
        }
    }

    pub fn setup(&self, value: usize) {
        let mut state = self.state.lock().unwrap();
        state.permits = if value == 0 { None } else { Some(value) };
    }

    /// Blocks until a permit is available, then consumes it. No-op if the
    /// throttle was never configured (`setup` not called with a nonzero value).
    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.permits {
                None => return,
                Some(0) => {
                    state = self.available.wait(state).unwrap();
                }
                Some(n) => {
                    state.permits = Some(n - 1);
                    return;
                }
            }
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.permits {
            state.permits = Some(n + 1);
            self.available.notify_one();
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_never_blocks() {
        let sem = Semaphore::new();
        for _ in 0..1000 {
            sem.acquire();
        }
    }

    #[test]
    fn configured_limits_concurrency() {
        let sem = std::sync::Arc::new(Semaphore::new());
        sem.setup(2);
        let active = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let sem = sem.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                scope.spawn(move || {
                    sem.acquire();
                    let n = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, std::sync::atomic::Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    sem.release();
                });
            }
        });
        assert!(max_seen.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
