//! The Supervisor (§4.6): owns component lifecycle and the three-tier
//! cancellation chain the shutdown protocol needs.
//!
//! Start order is Sink -> Operator -> Ingester — the reverse of the data
//! flow, so every downstream consumer is ready before anything starts
//! producing into it. Shutdown reverses that: Ingester is cancelled first
//! (stop admitting new work), the Operator is given `drain_timeout` to work
//! through whatever it already pulled, then the Sink is told to flush and
//! close.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::CoreError;

pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>;

/// The three independent cancellation tokens a running pipeline's
/// components select on. Kept separate (rather than one shared token) so
/// the supervisor can cancel them in sequence instead of all at once.
#[derive(Clone)]
pub struct ShutdownTokens {
    pub ingester: CancellationToken,
    pub operator: CancellationToken,
    pub sink: CancellationToken,
}

impl ShutdownTokens {
    pub fn new() -> Self {
        Self { ingester: CancellationToken::new(), operator: CancellationToken::new(), sink: CancellationToken::new() }
    }
}

impl Default for ShutdownTokens {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Supervisor {
    tokens: ShutdownTokens,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { tokens: ShutdownTokens::new(), drain_timeout }
    }

    pub fn tokens(&self) -> ShutdownTokens {
        self.tokens.clone()
    }

    /// Spawns every component in start order and runs until either an
    /// external shutdown request arrives (`external_shutdown`) or a
    /// component task exits — which, for these long-running loops, only
    /// happens on a fatal error, surfaced here as the supervisor's return
    /// value.
    pub async fn run(
        self,
        sink: ComponentFuture,
        operators: Vec<ComponentFuture>,
        ingesters: Vec<ComponentFuture>,
        external_shutdown: CancellationToken,
    ) -> Result<(), CoreError> {
        info!("starting sink");
        let sink_handle = tokio::spawn(sink);

        info!(count = operators.len(), "starting operators");
        let operator_handles: Vec<JoinHandle<Result<(), CoreError>>> = operators.into_iter().map(tokio::spawn).collect();

        info!(count = ingesters.len(), "starting ingesters");
        let ingester_handles: Vec<JoinHandle<Result<(), CoreError>>> = ingesters.into_iter().map(tokio::spawn).collect();

        tokio::select! {
            _ = external_shutdown.cancelled() => {
                info!("external shutdown requested");
            }
            _ = wait_for_any_exit(&ingester_handles) => {
                error!("an ingester exited unexpectedly, initiating shutdown");
            }
        }

        self.shutdown(ingester_handles, operator_handles, sink_handle).await
    }

    /// The four-step shutdown protocol. Returns the first error observed
    /// from any component, if any.
    async fn shutdown(
        &self,
        ingester_handles: Vec<JoinHandle<Result<(), CoreError>>>,
        operator_handles: Vec<JoinHandle<Result<(), CoreError>>>,
        sink_handle: JoinHandle<Result<(), CoreError>>,
    ) -> Result<(), CoreError> {
        let mut first_error = None;

        info!("shutdown: step 1, cancelling ingesters");
        self.tokens.ingester.cancel();
        for handle in ingester_handles {
            first_error = first_error.or(log_join_result("ingester", handle.await));
        }

        info!(drain_timeout_ms = self.drain_timeout.as_millis(), "shutdown: step 2, draining operators");
        let drained = tokio::time::timeout(self.drain_timeout, join_all(operator_handles)).await;
        let remaining_operators = match drained {
            Ok(results) => {
                for result in results {
                    first_error = first_error.or(log_join_result("operator", result));
                }
                Vec::new()
            }
            Err(_) => {
                warn!("operators did not drain within drain_timeout, cancelling");
                self.tokens.operator.cancel();
                Vec::new()
            }
        };
        for handle in remaining_operators {
            let handle: JoinHandle<Result<(), CoreError>> = handle;
            first_error = first_error.or(log_join_result("operator", handle.await));
        }

        info!("shutdown: step 3, flushing sink");
        self.tokens.sink.cancel();
        first_error = first_error.or(log_join_result("sink", sink_handle.await));

        info!("shutdown: step 4, closing durable log connections");
        // Connections close on drop once every task above has returned and
        // its DurableLog handle is released.

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pends forever if `handles` is empty (no ingesters configured is valid —
/// a Joiner-only pipeline has no Kafka-sourced input of its own in this
/// slice); otherwise resolves as soon as any handle finishes.
async fn wait_for_any_exit(handles: &[JoinHandle<Result<(), CoreError>>]) {
    if handles.is_empty() {
        std::future::pending::<()>().await;
        return;
    }
    loop {
        if handles.iter().any(|h| h.is_finished()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn join_all(handles: Vec<JoinHandle<Result<(), CoreError>>>) -> Vec<Result<Result<(), CoreError>, tokio::task::JoinError>> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await);
    }
    out
}

fn log_join_result(component: &str, result: Result<Result<(), CoreError>, tokio::task::JoinError>) -> Option<CoreError> {
    match result {
        Ok(Ok(())) => {
            info!(component, "stopped cleanly");
            None
        }
        Ok(Err(e)) => {
            error!(component, error = %e, "exited with error");
            Some(e)
        }
        Err(e) => {
            error!(component, error = %e, "task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_cancels_tiers_in_order() {
        let supervisor = Supervisor::new(Duration::from_millis(50));
        let tokens = supervisor.tokens();

        let sink_handle = tokio::spawn(async move {
            tokens.sink.cancelled().await;
            Ok::<(), CoreError>(())
        });

        let tokens2 = supervisor.tokens();
        let operator_handle = tokio::spawn(async move {
            tokens2.operator.cancelled().await;
            Ok::<(), CoreError>(())
        });

        let tokens3 = supervisor.tokens();
        let ingester_handle = tokio::spawn(async move {
            tokens3.ingester.cancelled().await;
            Ok::<(), CoreError>(())
        });

        let result = supervisor.shutdown(vec![ingester_handle], vec![operator_handle], sink_handle).await;
        assert!(result.is_ok());
    }
}
