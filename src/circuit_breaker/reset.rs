use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::breaker::{CircuitBreaker, StateTransition};

/// Moves open breakers to half-open once their reset timeout elapses, even
/// when no traffic arrives to trigger the lazy transition.
pub struct AutomaticResetManager {
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomaticResetManager {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start watching a breaker
    pub async fn watch(&self, breaker: Arc<CircuitBreaker>) {
        let transitions = breaker.subscribe();
        let stop = self.stop_tx.subscribe();
        tracing::debug!(breaker = %breaker.name(), "Automatic reset scheduling enabled");

        let task = tokio::spawn(run(breaker, transitions, stop));
        self.tasks.lock().await.push(task);
    }

    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Automatic reset manager stopped");
    }
}

impl Default for AutomaticResetManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(
    breaker: Arc<CircuitBreaker>,
    mut transitions: broadcast::Receiver<StateTransition>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        // Re-read after every event: the deadline moves each time the circuit opens
        let (armed, wake_at) = match breaker.open_deadline() {
            Some(deadline) => (true, deadline),
            None => (false, Instant::now()),
        };

        tokio::select! {
            _ = stop.changed() => break,
            event = transitions.recv() => match event {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(wake_at), if armed => {
                if breaker.try_half_open() {
                    tracing::info!(
                        breaker = %breaker.name(),
                        "Reset timeout elapsed, circuit breaker moved to half-open"
                    );
                }
            }
        }
    }
}
