use core::future::poll_fn;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

use embassy_sync::waitqueue::AtomicWaker;

/// "Station has associated and holds an IPv4 address."
///
/// Set-only from the network event tasks, waited on by the bootstrap. Once set it
/// stays set, so any number of later `wait` calls return immediately.
pub struct NetworkReady {
    ready: AtomicBool,
    waker: AtomicWaker,
}

impl NetworkReady {
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Waits until the bit is set. Supports a single waiter at a time.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.is_set() {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            if self.is_set() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

impl Default for NetworkReady {
    fn default() -> Self {
        Self::new()
    }
}
