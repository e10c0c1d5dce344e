use std::collections::VecDeque;

use tether_types::SignalPayload;

/// Orders inbound negotiation payloads for the current link.
///
/// Candidates that arrive before any session description are held back,
/// then released right after the first description in arrival order.
#[derive(Debug, Default)]
pub struct SignalReconciler {
    pending: VecDeque<SignalPayload>,
    has_description: bool,
}

impl SignalReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payloads to apply to the link now, in order. Empty when
    /// the payload was queued.
    pub fn admit(&mut self, signal: SignalPayload) -> Vec<SignalPayload> {
        if signal.is_description() {
            let first = !self.has_description;
            self.has_description = true;
            let mut ready = Vec::with_capacity(1 + self.pending.len());
            ready.push(signal);
            if first {
                ready.extend(self.pending.drain(..));
            }
            return ready;
        }

        if self.has_description {
            vec![signal]
        } else {
            self.pending.push_back(signal);
            Vec::new()
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn has_description(&self) -> bool {
        self.has_description
    }

    /// Drop queued candidates without touching the description flag.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Forget everything. Used whenever the link is destroyed.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.has_description = false;
    }
}
