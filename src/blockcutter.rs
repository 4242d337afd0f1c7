//! Batches normal envelopes into block-sized cuts.

use parking_lot::Mutex;

use crate::types::Envelope;

/// Accumulates ordered envelopes and cuts a batch once the configured
/// message count is reached; the batch timer cuts earlier via [`cut`].
///
/// [`cut`]: BlockCutter::cut
pub struct BlockCutter {
    max_message_count: usize,
    pending: Mutex<Vec<Envelope>>,
}

impl BlockCutter {
    pub fn new(max_message_count: usize) -> Self {
        BlockCutter {
            max_message_count: max_message_count.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues an envelope. Returns the batches that became full and
    /// whether envelopes remain pending.
    pub fn ordered(&self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool) {
        let mut pending = self.pending.lock();
        pending.push(envelope);
        if pending.len() >= self.max_message_count {
            (vec![std::mem::take(&mut *pending)], false)
        } else {
            (Vec::new(), true)
        }
    }

    /// Cuts whatever is pending, possibly an empty batch.
    pub fn cut(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuts_at_message_count() {
        let cutter = BlockCutter::new(2);
        let (batches, pending) = cutter.ordered(Envelope::normal("ch", b"a".to_vec()));
        assert!(batches.is_empty());
        assert!(pending);

        let (batches, pending) = cutter.ordered(Envelope::normal("ch", b"b".to_vec()));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(!pending);
    }

    #[test]
    fn cut_drains_pending() {
        let cutter = BlockCutter::new(10);
        cutter.ordered(Envelope::normal("ch", b"a".to_vec()));
        assert_eq!(cutter.cut().len(), 1);
        assert!(cutter.cut().is_empty());
    }
}
