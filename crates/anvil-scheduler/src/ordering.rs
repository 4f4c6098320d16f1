//! Response-order preservation
//!
//! When ordering preservation is enabled, every dispatched batch draws a
//! ticket under the scheduler mutex, so tickets match dispatch order
//! deterministically. Workers deposit finished batches keyed by ticket and
//! publication drains strictly in ticket order: if ticket K is missing,
//! K + 1 is not released until K appears.

use anvil_types::{InferenceRequest, ScheduleError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

/// A batch that finished execution and awaits publication
pub struct FinishedBatch {
    /// Requests in enqueue order, carrying their staged outcomes
    pub requests: Vec<InferenceRequest>,
    /// Batch-level execution status; an error here is fanned out to every
    /// request individually
    pub status: Result<(), ScheduleError>,
}

struct PendingSlots {
    next_to_publish: u64,
    ready: BTreeMap<u64, FinishedBatch>,
}

/// Re-serializes finished batches into ticket order before publication
///
/// The publisher is whichever worker just deposited, chosen by a try-lock
/// handoff; no dedicated thread. After releasing the publish gate the
/// holder re-checks for a freshly deposited next ticket, so a deposit that
/// lost the try-lock race is never stranded.
pub struct CompletionOrderer {
    pending: Mutex<PendingSlots>,
    publish_gate: Mutex<()>,
}

impl CompletionOrderer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(PendingSlots {
                next_to_publish: 0,
                ready: BTreeMap::new(),
            }),
            publish_gate: Mutex::new(()),
        }
    }

    /// Deposit a finished batch and publish everything that is now in order
    pub fn deposit(&self, ticket: u64, finished: FinishedBatch) {
        {
            let mut pending = self.pending.lock();
            pending.ready.insert(ticket, finished);
        }
        loop {
            let Some(gate) = self.publish_gate.try_lock() else {
                // Another worker is publishing; it re-checks after release.
                return;
            };
            loop {
                let next = {
                    let mut pending = self.pending.lock();
                    let ticket = pending.next_to_publish;
                    match pending.ready.remove(&ticket) {
                        Some(batch) => {
                            pending.next_to_publish += 1;
                            Some((ticket, batch))
                        }
                        None => None,
                    }
                };
                match next {
                    Some((ticket, batch)) => {
                        trace!(ticket, size = batch.requests.len(), "publishing batch");
                        publish(batch);
                    }
                    None => break,
                }
            }
            drop(gate);
            let more = {
                let pending = self.pending.lock();
                pending.ready.contains_key(&pending.next_to_publish)
            };
            if !more {
                return;
            }
        }
    }

    /// Number of batches deposited but not yet publishable
    pub fn backlog(&self) -> usize {
        self.pending.lock().ready.len()
    }
}

impl Default for CompletionOrderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Release a batch's responses to their callbacks, in enqueue order
pub fn publish(batch: FinishedBatch) {
    let status = batch.status;
    for request in batch.requests {
        request.publish_staged(&status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_types::{InputTensor, RequestOutcome, Responder};
    use std::sync::mpsc;

    fn finished(values: &[i64]) -> (FinishedBatch, Vec<mpsc::Receiver<RequestOutcome>>) {
        let mut requests = Vec::new();
        let mut receivers = Vec::new();
        for value in values {
            let (responder, rx) = Responder::channel();
            let mut request =
                InferenceRequest::new(vec![InputTensor::scalar("i", *value)], responder);
            request.set_outputs(vec![InputTensor::scalar("i", *value)]);
            requests.push(request);
            receivers.push(rx);
        }
        (
            FinishedBatch {
                requests,
                status: Ok(()),
            },
            receivers,
        )
    }

    #[test]
    fn in_order_deposit_publishes_immediately() {
        let orderer = CompletionOrderer::new();
        let (batch, receivers) = finished(&[1]);
        orderer.deposit(0, batch);
        assert!(receivers[0].try_recv().is_ok());
        assert_eq!(orderer.backlog(), 0);
    }

    #[test]
    fn gap_withholds_later_tickets() {
        let orderer = CompletionOrderer::new();
        let (second, second_rx) = finished(&[2]);
        orderer.deposit(1, second);
        // Ticket 0 has not arrived; ticket 1 must be withheld
        assert!(second_rx[0].try_recv().is_err());
        assert_eq!(orderer.backlog(), 1);

        let (first, first_rx) = finished(&[1]);
        orderer.deposit(0, first);
        assert!(first_rx[0].try_recv().is_ok());
        assert!(second_rx[0].try_recv().is_ok());
        assert_eq!(orderer.backlog(), 0);
    }

    #[test]
    fn batch_error_fans_out_to_every_request() {
        let orderer = CompletionOrderer::new();
        let (mut batch, receivers) = finished(&[1, 2, 3]);
        batch.status = Err(ScheduleError::execute_failed("backend fault"));
        orderer.deposit(0, batch);
        for rx in &receivers {
            let outcome = rx.try_recv().unwrap();
            assert!(matches!(
                outcome.status,
                Err(ScheduleError::ExecuteFailed { .. })
            ));
            assert!(outcome.outputs.is_empty());
        }
    }

    #[test]
    fn out_of_order_burst_publishes_in_ticket_order() {
        let orderer = CompletionOrderer::new();
        let (published_tx, published_rx) = mpsc::channel();

        let mut batches = Vec::new();
        for ticket in 0..4u64 {
            let tx = published_tx.clone();
            let responder = Responder::new(Box::new(move |_outcome| {
                let _ = tx.send(ticket);
            }));
            let request = InferenceRequest::new(vec![InputTensor::scalar("i", ticket as i64)], responder);
            batches.push(FinishedBatch {
                requests: vec![request],
                status: Ok(()),
            });
        }

        // Deposit in scrambled order
        let mut scrambled: Vec<(u64, FinishedBatch)> =
            batches.into_iter().enumerate().map(|(i, b)| (i as u64, b)).collect();
        scrambled.swap(0, 2);
        scrambled.swap(1, 3);
        for (ticket, batch) in scrambled {
            orderer.deposit(ticket, batch);
        }

        let order: Vec<u64> = published_rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
