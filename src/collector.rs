//! Gathering chunk results that arrive in any order.
//!
//! Every worker of a file holds a clone of the file's [`ChunkSink`]. The
//! channel closes once the last clone is dropped, which is how the
//! [`Collector`] learns that no more chunks will come.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::state::ChunkResult;

/// Producer side handed to each worker.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<ChunkResult>,
}

impl ChunkSink {
    /// Transfers ownership of `result` to the collector.
    pub fn deliver(&self, result: ChunkResult) -> Result<(), TransferError> {
        self.tx.send(result).map_err(|_| TransferError::Cancelled)
    }
}

/// Consumer side; buffers everything until the producers are done.
pub struct Collector {
    rx: mpsc::UnboundedReceiver<ChunkResult>,
    expected: usize,
    results: Vec<ChunkResult>,
}

/// Creates the channel for one file expecting `expected` chunk results.
pub fn channel(expected: usize) -> (ChunkSink, Collector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChunkSink { tx },
        Collector {
            rx,
            expected,
            results: Vec::with_capacity(expected),
        },
    )
}

impl Collector {
    /// Adds results that were satisfied without a worker.
    pub fn seed(&mut self, results: impl IntoIterator<Item = ChunkResult>) {
        self.results.extend(results);
    }

    /// Waits for the producers to finish and returns the results in index order.
    ///
    /// Fails with [`TransferError::Incomplete`] unless exactly the indices
    /// `0..expected` arrived, and with [`TransferError::Cancelled`] if `cancel`
    /// fires first.
    pub async fn collect(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkResult>, TransferError> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = self.rx.recv() => match next {
                    Some(result) => self.results.push(result),
                    None => break,
                },
            }
        }

        let mut results = self.results;
        results.sort_by_key(|r| r.index);

        let dense = results.iter().enumerate().all(|(i, r)| r.index == i);
        if results.len() != self.expected || !dense {
            return Err(TransferError::Incomplete {
                expected: self.expected,
                received: results.len(),
            });
        }
        Ok(results)
    }
}
