use log::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Closure run on its own thread after a delay unless cancelled first.
///
/// Dropping the job cancels it. Cancellation never waits: a job already past its delay runs
/// to completion, so the closure must re-check whatever made it worth running.
pub(in crate) struct DeferredJob {
    name: String,
    cancel: Option<mpsc::Sender<()>>,
}

impl DeferredJob {
    pub fn schedule<F>(name: String, delay: Duration, f: F) -> Option<Self>
        where F: FnOnce() + Send + 'static
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                match cancelled.recv_timeout(delay) {
                    Err(mpsc::RecvTimeoutError::Timeout) => f(),
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
                }
            });
        match spawned {
            Ok(_) => {
                trace!("scheduled '{}' in {:?}", name, delay);
                Some(Self {
                    name,
                    cancel: Some(cancel),
                })
            }
            Err(e) => {
                warn!("couldn't schedule '{}': {}", name, e);
                None
            }
        }
    }

    pub fn cancel(mut self) {
        self.cancel0();
    }

    fn cancel0(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            trace!("cancelling '{}'", self.name);
            let _ = cancel.send(());
        }
    }
}

impl Drop for DeferredJob {
    fn drop(&mut self) {
        self.cancel0();
    }
}
