//! Resumable chunked processing with database-backed checkpoints.
//!
//! [`BatchIterator`] yields fixed-size batches and persists its position;
//! [`ChunkedProcessor`] drives a work function over the batches with
//! cancellation, per-item error policy, and automatic resume.

use anyhow::Result;
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;

use crate::db::jobs::CheckpointRow;
use crate::db::CatalogDb;

pub struct BatchIterator<T> {
    db: Arc<CatalogDb>,
    items: Vec<T>,
    batch_size: usize,
    checkpoint_key: Option<String>,
    current_index: usize,
}

impl<T: Clone + Display> BatchIterator<T> {
    pub fn new(
        db: Arc<CatalogDb>,
        items: Vec<T>,
        batch_size: usize,
        checkpoint_key: Option<String>,
    ) -> Self {
        Self {
            db,
            items,
            batch_size: batch_size.max(1),
            checkpoint_key,
            current_index: 0,
        }
    }

    pub fn next_batch(&mut self) -> Option<Vec<T>> {
        if self.current_index >= self.items.len() {
            return None;
        }
        let end = (self.current_index + self.batch_size).min(self.items.len());
        let batch = self.items[self.current_index..end].to_vec();
        self.current_index = end;
        Some(batch)
    }

    pub fn processed(&self) -> usize {
        self.current_index
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.current_index
    }

    /// Progress fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.items.is_empty() {
            return 1.0;
        }
        self.current_index as f64 / self.items.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.items.len()
    }

    /// Persist the current position. No-op without a checkpoint key.
    pub fn save_checkpoint(&self, extra_data: Option<&Value>) -> Result<()> {
        let Some(key) = &self.checkpoint_key else {
            return Ok(());
        };
        let last_item_id = self
            .current_index
            .checked_sub(1)
            .and_then(|i| self.items.get(i))
            .map(|item| item.to_string());
        let extra_json = extra_data.map(|v| v.to_string());
        self.db.save_checkpoint(
            key,
            self.current_index as i64,
            self.items.len() as i64,
            self.current_index as i64,
            last_item_id.as_deref(),
            extra_json.as_deref(),
        )
    }

    /// Resume from a persisted position. Returns true when a checkpoint was
    /// found and applied.
    pub fn load_checkpoint(&mut self) -> Result<bool> {
        let Some(key) = &self.checkpoint_key else {
            return Ok(false);
        };
        let Some(row) = self.db.load_checkpoint(key)? else {
            return Ok(false);
        };
        self.current_index = (row.last_item_index.max(0) as usize).min(self.items.len());
        tracing::info!(
            checkpoint_key = key,
            resume_index = self.current_index,
            "Resumed from checkpoint"
        );
        Ok(true)
    }

    pub fn clear_checkpoint(&self) -> Result<()> {
        if let Some(key) = &self.checkpoint_key {
            self.db.clear_checkpoint(key)?;
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<Option<CheckpointRow>> {
        match &self.checkpoint_key {
            Some(key) => self.db.load_checkpoint(key),
            None => Ok(None),
        }
    }
}

/// What to do when one item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemErrorPolicy {
    /// Log, count, and continue with the next item.
    Skip,
    /// Propagate the error; the last batch checkpoint stays in place.
    Fatal,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorOutcome {
    pub processed: usize,
    pub skipped: usize,
}

/// Callbacks for one `run`. All optional.
#[derive(Default)]
pub struct RunHooks<'a> {
    pub on_progress: Option<&'a dyn Fn(usize, usize)>,
    pub should_cancel: Option<&'a dyn Fn() -> bool>,
    pub on_batch_complete: Option<&'a dyn Fn(usize, usize)>,
}

pub struct ChunkedProcessor<'f, T> {
    iterator: BatchIterator<T>,
    process_fn: Box<dyn FnMut(&T) -> Result<()> + 'f>,
    on_item_error: ItemErrorPolicy,
    outcome: ProcessorOutcome,
}

impl<'f, T: Clone + Display> ChunkedProcessor<'f, T> {
    pub fn new(
        db: Arc<CatalogDb>,
        items: Vec<T>,
        process_fn: impl FnMut(&T) -> Result<()> + 'f,
        batch_size: usize,
        checkpoint_key: &str,
        on_item_error: ItemErrorPolicy,
    ) -> Self {
        Self {
            iterator: BatchIterator::new(
                db,
                items,
                batch_size,
                Some(checkpoint_key.to_string()),
            ),
            process_fn: Box::new(process_fn),
            on_item_error,
            outcome: ProcessorOutcome::default(),
        }
    }

    pub fn outcome(&self) -> &ProcessorOutcome {
        &self.outcome
    }

    /// Process all items. Resumes from a saved checkpoint when one exists.
    ///
    /// Returns `Ok(true)` on completion (checkpoint cleared), `Ok(false)`
    /// on cancellation (checkpoint saved with a canceled marker), and an
    /// error only for fatal item failures.
    pub fn run(&mut self, hooks: RunHooks<'_>) -> Result<bool> {
        self.iterator.load_checkpoint()?;

        while let Some(batch) = self.iterator.next_batch() {
            for item in &batch {
                if let Some(should_cancel) = hooks.should_cancel {
                    if should_cancel() {
                        return self.cancel();
                    }
                }

                if let Err(e) = (self.process_fn)(item) {
                    match self.on_item_error {
                        ItemErrorPolicy::Skip => {
                            tracing::warn!(item = %item, error = %e, "Skipping failed item");
                            self.outcome.skipped += 1;
                        }
                        ItemErrorPolicy::Fatal => return Err(e),
                    }
                }
                self.outcome.processed += 1;
            }

            self.iterator.save_checkpoint(None)?;
            if let Some(on_batch_complete) = hooks.on_batch_complete {
                on_batch_complete(self.iterator.processed(), self.iterator.total());
            }
            if let Some(on_progress) = hooks.on_progress {
                on_progress(self.iterator.processed(), self.iterator.total());
            }
        }

        self.iterator.clear_checkpoint()?;
        Ok(true)
    }

    fn cancel(&mut self) -> Result<bool> {
        self.iterator
            .save_checkpoint(Some(&serde_json::json!({"canceled": true})))?;
        tracing::info!(
            processed = self.iterator.processed(),
            total = self.iterator.total(),
            "Batch processing canceled"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;
    use std::cell::Cell;

    #[test]
    fn test_batch_iterator_shapes() {
        let (_dir, db) = open_temp();
        let mut iterator = BatchIterator::new(db, (1..=10).collect::<Vec<i32>>(), 4, None);

        assert_eq!(iterator.next_batch().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(iterator.next_batch().unwrap(), vec![5, 6, 7, 8]);
        assert_eq!(iterator.remaining(), 2);
        assert_eq!(iterator.next_batch().unwrap(), vec![9, 10]);
        assert!(iterator.next_batch().is_none());
        assert!(iterator.is_complete());
        assert!((iterator.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resumable_after_fatal_error() {
        let (_dir, db) = open_temp();
        let items: Vec<i32> = (1..=1000).collect();

        // First run: item 237 is fatal.
        let mut done = std::collections::HashSet::new();
        {
            let mut processor = ChunkedProcessor::new(
                db.clone(),
                items.clone(),
                |item| {
                    if *item == 237 {
                        anyhow::bail!("bad item");
                    }
                    done.insert(*item);
                    Ok(())
                },
                50,
                "K",
                ItemErrorPolicy::Fatal,
            );
            assert!(processor.run(RunHooks::default()).is_err());
        }

        // Checkpoint sits at the last completed batch boundary.
        let row = db.load_checkpoint("K").unwrap().unwrap();
        assert_eq!(row.items_processed, 200);
        assert_eq!(row.last_item_id.as_deref(), Some("200"));

        // Second run with a fixed function resumes at the checkpoint and
        // finishes; the aborted batch replays, so idempotent work sees
        // every item exactly once overall.
        {
            let mut processor = ChunkedProcessor::new(
                db.clone(),
                items,
                |item| {
                    done.insert(*item);
                    Ok(())
                },
                50,
                "K",
                ItemErrorPolicy::Fatal,
            );
            assert!(processor.run(RunHooks::default()).unwrap());
        }

        assert_eq!(done.len(), 1000);
        assert!(db.load_checkpoint("K").unwrap().is_none());
    }

    #[test]
    fn test_cancellation_saves_checkpoint() {
        let (_dir, db) = open_temp();
        let items: Vec<i32> = (1..=100).collect();
        let seen = Cell::new(0usize);

        let mut processor = ChunkedProcessor::new(
            db.clone(),
            items,
            |_| {
                seen.set(seen.get() + 1);
                Ok(())
            },
            10,
            "cancel-key",
            ItemErrorPolicy::Fatal,
        );

        let cancel_after = 25usize;
        let completed = processor
            .run(RunHooks {
                should_cancel: Some(&|| seen.get() >= cancel_after),
                ..Default::default()
            })
            .unwrap();
        assert!(!completed);

        let row = db.load_checkpoint("cancel-key").unwrap().unwrap();
        assert_eq!(row.items_processed, 20);
        let extra: serde_json::Value =
            serde_json::from_str(row.extra_data_json.as_deref().unwrap()).unwrap();
        assert_eq!(extra["canceled"], true);
    }

    #[test]
    fn test_skip_policy_counts_failures() {
        let (_dir, db) = open_temp();
        let items: Vec<i32> = (1..=20).collect();

        let mut processor = ChunkedProcessor::new(
            db,
            items,
            |item| {
                if item % 7 == 0 {
                    anyhow::bail!("unlucky");
                }
                Ok(())
            },
            5,
            "skip-key",
            ItemErrorPolicy::Skip,
        );

        assert!(processor.run(RunHooks::default()).unwrap());
        assert_eq!(processor.outcome().processed, 20);
        assert_eq!(processor.outcome().skipped, 2);
    }

    #[test]
    fn test_progress_hooks_fire_per_batch() {
        let (_dir, db) = open_temp();
        let items: Vec<i32> = (1..=30).collect();
        let batches = Cell::new(0usize);

        let mut processor = ChunkedProcessor::new(
            db,
            items,
            |_| Ok(()),
            10,
            "hook-key",
            ItemErrorPolicy::Fatal,
        );
        processor
            .run(RunHooks {
                on_batch_complete: Some(&|_done, _total| batches.set(batches.get() + 1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(batches.get(), 3);
    }
}
