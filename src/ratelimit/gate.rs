//! Connection attempt spacing
//!
//! One gate is shared by every shard of a process. `wait()` callers are
//! served strictly in arrival order (tokio's mutex is fair) and each turn
//! starts at least `delay` after the previous one.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// FIFO serializer for connection attempts
#[derive(Debug)]
pub struct ConnectGate {
    delay: Duration,
    last_turn: Mutex<Option<Instant>>,
}

impl ConnectGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_turn: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Block until it is this caller's turn.
    ///
    /// Dropping the returned future gives up the place in the queue.
    pub async fn wait(&self) {
        let mut last_turn = self.last_turn.lock().await;
        if let Some(previous) = *last_turn {
            let turn_at = previous + self.delay;
            if turn_at > Instant::now() {
                debug!(wait_ms = (turn_at - Instant::now()).as_millis() as u64, "Waiting for connect turn");
                tokio::time::sleep_until(turn_at).await;
            }
        }
        *last_turn = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_turn_is_immediate() {
        let gate = ConnectGate::new(Duration::from_secs(5));
        let started = Instant::now();
        gate.wait().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_turns_are_spaced() {
        let gate = ConnectGate::new(Duration::from_millis(5300));
        let started = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert_eq!(started.elapsed(), Duration::from_millis(10_600));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let gate = Arc::new(ConnectGate::new(Duration::from_secs(5)));
        let started = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move {
                gate.wait().await;
                Instant::now()
            }));
        }

        let mut turns = Vec::new();
        for task in tasks {
            turns.push(task.await.unwrap() - started);
        }
        turns.sort();
        assert_eq!(
            turns,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gate_does_not_delay() {
        let gate = ConnectGate::new(Duration::from_secs(5));
        gate.wait().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let started = Instant::now();
        gate.wait().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
