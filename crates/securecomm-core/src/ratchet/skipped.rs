//! Cache of message keys derived ahead of out-of-order deliveries.

use std::collections::{HashMap, VecDeque};

use securecomm_crypto::{MessageKey, PublicKey};

/// Receiving chain a skipped key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChainId {
    /// Chain seeded from the shared root key before any DH step
    Bootstrap,
    /// Chain opened by the remote's ratchet public key
    Dh(PublicKey),
}

/// Bounded FIFO map of `(chain, message_number)` to message key.
///
/// Once full, inserting evicts the oldest entry. An evicted key is gone for
/// good, so the message it would have opened reports as a replay.
#[derive(Clone, Default)]
pub(crate) struct SkippedKeys {
    keys: HashMap<(ChainId, u32), MessageKey>,
    order: VecDeque<(ChainId, u32)>,
}

impl SkippedKeys {
    pub(crate) fn get(&self, chain: ChainId, index: u32) -> Option<&MessageKey> {
        self.keys.get(&(chain, index))
    }

    pub(crate) fn insert(&mut self, chain: ChainId, key: MessageKey, capacity: usize) {
        let slot = (chain, key.index());
        if self.keys.insert(slot, key).is_none() {
            self.order.push_back(slot);
        }

        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
                tracing::debug!(index = oldest.1, "evicted skipped message key");
            }
        }
    }

    pub(crate) fn remove(&mut self, chain: ChainId, index: u32) -> Option<MessageKey> {
        let removed = self.keys.remove(&(chain, index))?;
        self.order.retain(|slot| *slot != (chain, index));
        Some(removed)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Entries oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (ChainId, &MessageKey)> {
        self.order.iter().filter_map(|slot| self.keys.get(slot).map(|key| (slot.0, key)))
    }
}
