//! Session loop
//!
//! Every top-level dial gets its own OS thread running a `current_thread`
//! tokio runtime. The russh handshake, the handle owner task, channel pumps
//! and all Reading/Writing actors of that connection live on it. Callers on
//! other runtimes hop onto the loop with [`SessionLoop::run`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::SshError;

pub struct SessionLoop {
    name: String,
    handle: Handle,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    running: AtomicBool,
}

impl SessionLoop {
    /// Start a dedicated loop thread.
    pub async fn start(name: &str) -> Result<Arc<Self>, SshError> {
        let (handle_tx, handle_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread_name = format!("ssh-loop-{}", name);

        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Session loop {} stopping", thread_name);
            })
            .map_err(|e| SshError::Io(format!("failed to spawn session loop: {}", e)))?;

        let handle = handle_rx
            .await
            .map_err(|_| SshError::Io("session loop exited during startup".into()))?
            .map_err(|e| SshError::Io(format!("failed to build session runtime: {}", e)))?;

        info!("Session loop {} started", name);
        Ok(Arc::new(Self {
            name: name.to_string(),
            handle,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            running: AtomicBool::new(true),
        }))
    }

    /// Borrow an existing runtime instead of starting a thread.
    /// `shutdown` is then a no-op for the runtime itself.
    pub fn attach(name: &str, handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handle,
            shutdown_tx: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Run `fut` on the loop and wait for its result from any context.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, SshError>
    where
        F: Future<Output = Result<T, SshError>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_running() {
            return Err(SshError::Disconnected);
        }
        self.handle
            .spawn(fut)
            .await
            .map_err(|_| SshError::Disconnected)?
    }

    /// Stop the loop. Tasks still spawned on it are dropped. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.shutdown_tx.lock().take() {
            info!("Shutting down session loop {}", self.name);
            let _ = tx.send(());
        }
    }
}

impl Drop for SessionLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
