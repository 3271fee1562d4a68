//! Lazy, forward-only ledger history

use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;

use super::entry::LedgerEntry;
use crate::core_types::{LedgerEntryId, UserId};
use crate::store::PointsStore;
use crate::transfer::TransferError;

/// Upper bound of a history snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Unresolved,
    Empty,
    UpTo(LedgerEntryId),
}

/// A user's ledger entries in creation order, fetched page by page.
///
/// The sequence is finite: its end is the newest entry committed when the
/// first page is fetched. [`LedgerHistory::restart`] rewinds to the first
/// entry over the same snapshot.
pub struct LedgerHistory {
    store: Arc<dyn PointsStore>,
    user_id: UserId,
    page_size: usize,
    bound: Bound,
    cursor: Option<LedgerEntryId>,
    buffer: VecDeque<LedgerEntry>,
    drained: bool,
}

impl LedgerHistory {
    pub(crate) fn new(store: Arc<dyn PointsStore>, user_id: UserId, page_size: usize) -> Self {
        Self {
            store,
            user_id,
            page_size: page_size.max(1),
            bound: Bound::Unresolved,
            cursor: None,
            buffer: VecDeque::new(),
            drained: false,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Next entry, or `None` once the snapshot is exhausted
    pub async fn next(&mut self) -> Result<Option<LedgerEntry>, TransferError> {
        if let Some(entry) = self.buffer.pop_front() {
            self.cursor = Some(entry.id);
            return Ok(Some(entry));
        }
        if self.drained {
            return Ok(None);
        }

        if self.bound == Bound::Unresolved {
            self.bound = match self.store.latest_entry_id(self.user_id).await? {
                Some(id) => Bound::UpTo(id),
                None => Bound::Empty,
            };
        }
        let Bound::UpTo(up_to) = self.bound else {
            self.drained = true;
            return Ok(None);
        };

        let page = self
            .store
            .ledger_page(self.user_id, self.cursor, up_to, self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.drained = true;
        }
        self.buffer.extend(page);

        match self.buffer.pop_front() {
            Some(entry) => {
                self.cursor = Some(entry.id);
                Ok(Some(entry))
            }
            None => {
                self.drained = true;
                Ok(None)
            }
        }
    }

    /// Rewind to the first entry; the snapshot bound is kept
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.drained = false;
    }

    /// Drain the remaining entries
    pub async fn collect_remaining(&mut self) -> Result<Vec<LedgerEntry>, TransferError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<LedgerEntry, TransferError>> {
        futures::stream::try_unfold(self, |mut history| async move {
            Ok::<_, TransferError>(history.next().await?.map(|entry| (entry, history)))
        })
    }
}
