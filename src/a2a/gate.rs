//! A2A Concurrency Gate: a per-agent FIFO semaphore. Agents are fully
//! isolated — counters and wait queues never share state across agent ids.

use crate::constants;
use crate::{FleetError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

#[derive(Clone)]
pub struct ConcurrencyGate {
    max_concurrent_flows: usize,
    queue_timeout: Duration,
    agents: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

/// Held concurrency permit. Dropping it (or calling `release`) frees the
/// slot and wakes the head of that agent's wait queue.
#[derive(Debug)]
pub struct FlowPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl FlowPermit {
    pub fn release(mut self) {
        self.permit.take();
    }
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        ConcurrencyGate::with_limits(
            constants::DEFAULT_MAX_CONCURRENT_FLOWS,
            Duration::from_millis(constants::DEFAULT_QUEUE_TIMEOUT_MS),
        )
    }

    pub fn with_limits(max_concurrent_flows: usize, queue_timeout: Duration) -> Self {
        ConcurrencyGate {
            max_concurrent_flows,
            queue_timeout,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn semaphore_for(&self, agent_id: &str) -> Arc<Semaphore> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_flows)))
            .clone()
    }

    /// Returns when `active[agentId] < maxConcurrentFlows`, else waits up to
    /// `queueTimeoutMs` before failing with a structured `GateTimeout`.
    pub async fn acquire(&self, agent_id: &str, flow_id: &str) -> Result<FlowPermit> {
        let sem = self.semaphore_for(agent_id).await;
        let active = self.max_concurrent_flows - sem.available_permits();

        match timeout(self.queue_timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(FlowPermit { permit: Some(permit) }),
            Ok(Err(_)) => Err(FleetError::Internal(anyhow::anyhow!("concurrency gate semaphore closed"))),
            Err(_) => Err(FleetError::GateTimeout {
                agent_id: agent_id.to_string(),
                flow_id: flow_id.to_string(),
                active,
                timeout_ms: self.queue_timeout.as_millis() as u64,
            }),
        }
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A waiter queued behind a held permit times out if nothing releases it.
    #[tokio::test]
    async fn third_waiter_times_out_after_second_is_released_by_nothing() {
        let gate = ConcurrencyGate::with_limits(1, Duration::from_millis(50));

        let p1 = gate.acquire("A", "f1").await.unwrap();

        let gate2 = gate.clone();
        let f2 = tokio::spawn(async move { gate2.acquire("A", "f2").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(p1);

        let p2 = f2.await.unwrap().unwrap();

        let err = gate.acquire("A", "f3").await.unwrap_err();
        match err {
            FleetError::GateTimeout { agent_id, flow_id, timeout_ms, .. } => {
                assert_eq!(agent_id, "A");
                assert_eq!(flow_id, "f3");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected GateTimeout, got {other:?}"),
        }
        drop(p2);
    }

    #[tokio::test]
    async fn agents_do_not_share_slots() {
        let gate = ConcurrencyGate::with_limits(1, Duration::from_millis(50));
        let _a = gate.acquire("A", "f1").await.unwrap();
        let b = gate.acquire("B", "f1").await;
        assert!(b.is_ok());
    }
}
