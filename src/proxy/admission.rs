// Admission gate - bounded, non-blocking concurrency control
//
// A counting semaphore sized to `max_concurrent_connections`. Chat requests
// must take a permit before any upstream work; when the gate is saturated the
// caller is rejected immediately with 503 and nothing queues. Health, status
// and model-list endpoints never touch the gate.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::monitor::Counters;

/// RAII guard for one admitted request.
///
/// Holds the semaphore slot and keeps the in-flight gauge accurate: the
/// gauge is incremented on acquire and decremented on drop, so every exit
/// path (completion, client disconnect, deadline expiry) releases exactly
/// once. For streaming responses the permit is moved into the response body
/// task so the slot stays taken until the final frame.
pub struct AdmissionPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.connection_closed();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish()
    }
}

/// The single admission decision point for chat requests.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl AdmissionGate {
    pub fn new(capacity: usize, counters: Arc<Counters>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters,
        }
    }

    /// Try to admit one request. Never blocks: `None` means saturated and
    /// the caller must reject with 503.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.counters.connection_opened();
                Some(AdmissionPermit {
                    permit,
                    counters: self.counters.clone(),
                })
            }
            Err(_) => None,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let counters = Arc::new(Counters::new());
        let gate = AdmissionGate::new(2, counters.clone());

        let p1 = gate.try_acquire().expect("first permit");
        let p2 = gate.try_acquire().expect("second permit");
        assert_eq!(counters.current_connections(), 2);
        assert_eq!(gate.available_permits(), 0);

        // Saturated: third request is rejected without blocking.
        assert!(gate.try_acquire().is_none());
        assert_eq!(counters.current_connections(), 2);

        drop(p1);
        assert_eq!(counters.current_connections(), 1);
        let p3 = gate.try_acquire().expect("slot freed");
        assert_eq!(counters.current_connections(), 2);

        drop(p2);
        drop(p3);
        assert_eq!(counters.current_connections(), 0);
        assert_eq!(gate.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_gauge_never_exceeds_capacity() {
        let counters = Arc::new(Counters::new());
        let gate = AdmissionGate::new(4, counters.clone());

        let mut held = Vec::new();
        for _ in 0..32 {
            if let Some(p) = gate.try_acquire() {
                held.push(p);
            }
            assert!(counters.current_connections() <= 4);
        }
        assert_eq!(held.len(), 4);
        held.clear();
        assert_eq!(counters.current_connections(), 0);
    }

    #[tokio::test]
    async fn test_permit_moved_across_tasks() {
        let counters = Arc::new(Counters::new());
        let gate = AdmissionGate::new(1, counters.clone());

        let permit = gate.try_acquire().expect("permit");
        let handle = tokio::spawn(async move {
            // Simulate a streaming body holding the slot.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            drop(permit);
        });
        assert!(gate.try_acquire().is_none());
        handle.await.unwrap();
        assert!(gate.try_acquire().is_some());
    }
}
