//! The per-pass container of message buckets.
//!
//! Every message of a batch starts in `incoming` and must end the pass in
//! exactly one of the four buckets. Stages move messages between buckets;
//! they never drop one (a skipped message goes to `rejected` so the transport
//! can still acknowledge it).

use crate::types::Message;

/// One of the four buckets of a [`Worklist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Accepted, awaiting further work.
    Incoming,
    /// Fully handled.
    Ok,
    /// Not relevant or refused by policy; acknowledged but otherwise discarded.
    Rejected,
    /// Failed transiently; handed to the retry queue.
    Retry,
}

/// Four ordered message buckets threaded through one pipeline pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Worklist {
    pub incoming: Vec<Message>,
    pub ok: Vec<Message>,
    pub rejected: Vec<Message>,
    pub retry: Vec<Message>,
}

impl Worklist {
    /// Starts a pass with every message in `incoming`.
    pub fn new(batch: Vec<Message>) -> Self {
        Worklist {
            incoming: batch,
            ..Worklist::default()
        }
    }

    /// Total number of messages across all buckets.
    pub fn len(&self) -> usize {
        self.incoming.len() + self.ok.len() + self.rejected.len() + self.retry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every message, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.incoming
            .iter()
            .chain(&self.ok)
            .chain(&self.rejected)
            .chain(&self.retry)
    }

    pub fn bucket(&self, bucket: Bucket) -> &[Message] {
        match bucket {
            Bucket::Incoming => &self.incoming,
            Bucket::Ok => &self.ok,
            Bucket::Rejected => &self.rejected,
            Bucket::Retry => &self.retry,
        }
    }

    pub fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<Message> {
        match bucket {
            Bucket::Incoming => &mut self.incoming,
            Bucket::Ok => &mut self.ok,
            Bucket::Rejected => &mut self.rejected,
            Bucket::Retry => &mut self.retry,
        }
    }

    /// Routes every `incoming` message to the bucket chosen by `route`.
    ///
    /// Messages kept in `incoming` retain their relative order.
    pub fn route_incoming<F>(&mut self, mut route: F)
    where
        F: FnMut(&mut Message) -> Bucket,
    {
        for mut msg in std::mem::take(&mut self.incoming) {
            let bucket = route(&mut msg);
            self.bucket_mut(bucket).push(msg);
        }
    }

    /// Like [`Worklist::route_incoming`], but stops at the first error.
    ///
    /// The failing message and every message not yet routed stay in
    /// `incoming`; messages already routed keep their new placement.
    pub fn try_route_incoming<F, E>(&mut self, mut route: F) -> Result<(), E>
    where
        F: FnMut(&mut Message) -> Result<Bucket, E>,
    {
        let mut pending = std::mem::take(&mut self.incoming).into_iter();
        while let Some(mut msg) = pending.next() {
            match route(&mut msg) {
                Ok(bucket) => self.bucket_mut(bucket).push(msg),
                Err(e) => {
                    self.incoming.push(msg);
                    self.incoming.extend(pending);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Moves everything left in `incoming` to `ok`.
    pub fn promote_incoming(&mut self) {
        let incoming = std::mem::take(&mut self.incoming);
        self.ok.extend(incoming);
    }
}
