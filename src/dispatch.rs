// ABOUTME: Owner execution context for callbacks raised by worker threads.
// ABOUTME: Workers post boxed tasks; the owning context drains and runs them.

use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send>;

/// Queue drained by the owner of tunnels and shell bridges.
pub struct OwnerQueue {
    tx: mpsc::UnboundedSender<Task>,
    rx: mpsc::UnboundedReceiver<Task>,
}

/// Cloneable handle used by worker threads to post tasks.
#[derive(Clone)]
pub struct Poster {
    tx: mpsc::UnboundedSender<Task>,
}

impl Poster {
    /// Schedule `task` on the owner's context. Returns false if the owner is gone.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

impl OwnerQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn poster(&self) -> Poster {
        Poster {
            tx: self.tx.clone(),
        }
    }

    /// Run every task already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it.
    ///
    /// The queue holds a sender of its own, so this only returns after a task ran.
    pub async fn next(&mut self) {
        if let Some(task) = self.rx.recv().await {
            task();
        }
    }
}

impl Default for OwnerQueue {
    fn default() -> Self {
        Self::new()
    }
}
