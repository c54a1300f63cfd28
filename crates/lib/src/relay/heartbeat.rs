//! Heartbeat monitor: periodic liveness sweep over the registry.
//!
//! A sweep closes every connection that has not pinged or ponged since the previous sweep,
//! clears the liveness flag of the rest, then pings them. A connection therefore gets exactly
//! one interval of grace to answer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::relay::frame::PING_FRAME;
use crate::relay::registry::{ClientId, Registry};

/// Default interval between sweeps.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sweep {
    /// Closed for missing the previous ping, or because the ping could not be queued.
    pub evicted: Vec<ClientId>,
    pub pinged: Vec<ClientId>,
}

impl Registry {
    /// Run one liveness sweep.
    pub async fn sweep(&self) -> Sweep {
        let mut state = self.inner.write().await;
        let mut sweep = Sweep::default();
        if state.clients.is_empty() {
            return sweep;
        }

        for (id, record) in state.clients.iter_mut() {
            if record.conn.is_closed() {
                // Already closed; its read loop is tearing it down.
                continue;
            }
            if !record.alive {
                log::error!("no pong from {}, closing connection", id);
                record.conn.close();
                sweep.evicted.push(id.clone());
                continue;
            }
            record.alive = false;
        }

        for (id, record) in &state.clients {
            if record.conn.is_closed() {
                continue;
            }
            match record.conn.send(PING_FRAME.to_vec()) {
                Ok(()) => sweep.pinged.push(id.clone()),
                Err(e) => {
                    log::error!("ping failed for {}: {}", id, e);
                    record.conn.close();
                    sweep.evicted.push(id.clone());
                }
            }
        }
        sweep
    }
}

/// Start the monitor on its own task. The first sweep runs one full interval after start.
pub fn spawn(registry: Arc<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sweep = registry.sweep().await;
            if !sweep.evicted.is_empty() || !sweep.pinged.is_empty() {
                log::debug!(
                    "heartbeat: pinged {}, evicted {}",
                    sweep.pinged.len(),
                    sweep.evicted.len()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::ConnectionHandle;

    #[tokio::test]
    async fn empty_registry_is_skipped() {
        let registry = Registry::new();
        assert_eq!(registry.sweep().await, Sweep::default());
    }

    #[tokio::test]
    async fn silent_connection_is_closed_on_following_sweep() {
        let registry = Registry::new();
        let (conn, mut rx) = ConnectionHandle::new();
        let handle = conn.clone();
        let a = registry.admit(None, conn).await;
        rx.try_recv().unwrap();

        let first = registry.sweep().await;
        assert_eq!(first.pinged, vec![a.id.clone()]);
        assert!(first.evicted.is_empty());
        assert!(!registry.client(&a.id).await.unwrap().alive);
        assert_eq!(rx.try_recv().unwrap(), PING_FRAME.to_vec());

        let second = registry.sweep().await;
        assert_eq!(second.evicted, vec![a.id.clone()]);
        assert!(second.pinged.is_empty());
        assert!(handle.is_closed());

        // Still registered until its read loop tears it down, but not evicted twice.
        let third = registry.sweep().await;
        assert!(third.evicted.is_empty());
    }

    #[tokio::test]
    async fn answering_connection_survives() {
        let registry = Registry::new();
        let (conn, _rx) = ConnectionHandle::new();
        let handle = conn.clone();
        let a = registry.admit(None, conn).await;

        for _ in 0..5 {
            let sweep = registry.sweep().await;
            assert_eq!(sweep.pinged, vec![a.id.clone()]);
            registry.mark_alive(&a.id).await;
        }
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn failed_ping_closes_connection() {
        let registry = Registry::new();
        let (conn, rx) = ConnectionHandle::new();
        let handle = conn.clone();
        let a = registry.admit(None, conn).await;
        drop(rx);

        let sweep = registry.sweep().await;
        assert_eq!(sweep.evicted, vec![a.id]);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_ticks_on_interval() {
        let registry = Arc::new(Registry::new());
        let (conn, mut rx) = ConnectionHandle::new();
        let handle = conn.clone();
        registry.admit(None, conn).await;
        rx.try_recv().unwrap();

        let task = spawn(registry.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rx.try_recv().unwrap(), PING_FRAME.to_vec());
        assert!(!handle.is_closed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(handle.is_closed());
        task.abort();
    }
}
