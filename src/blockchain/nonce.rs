//! Serialized nonce allocation for the signer address.
//!
//! Every submission holds the allocator from nonce selection until the node
//! has accepted (or rejected) the broadcast, so two in-process submitters can
//! never sign with the same nonce.

use tokio::sync::{Mutex, MutexGuard};

/// Owner of the next local nonce.
#[derive(Debug, Default)]
pub struct NonceAllocator {
    next: Mutex<Option<u64>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the allocator for one submission.
    pub async fn lock(&self) -> NonceLease<'_> {
        NonceLease {
            next: self.next.lock().await,
            reserved: None,
        }
    }
}

/// Exclusive hold on the allocator for the duration of a submission.
#[derive(Debug)]
pub struct NonceLease<'a> {
    next: MutexGuard<'a, Option<u64>>,
    reserved: Option<u64>,
}

impl NonceLease<'_> {
    /// Pick the nonce: the larger of the chain's pending count and the local
    /// successor of the last broadcast nonce.
    pub fn reserve(&mut self, pending_on_chain: u64) -> u64 {
        let nonce = match *self.next {
            Some(local) => local.max(pending_on_chain),
            None => pending_on_chain,
        };
        self.reserved = Some(nonce);
        nonce
    }

    /// The broadcast was accepted; advance past the reserved nonce.
    pub fn commit(mut self) {
        if let Some(nonce) = self.reserved.take() {
            *self.next = Some(nonce + 1);
        }
    }

    /// The broadcast failed; fall back to the chain's count next time.
    pub fn invalidate(mut self) {
        self.reserved = None;
        *self.next = None;
    }
}
