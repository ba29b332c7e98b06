//! Folding a committed batch back into the tracker.

use crate::command::CommandBatch;
use crate::entry::EntityState;
use crate::error::TrackerError;
use crate::executor::ExecutionResult;
use crate::tracker::ChangeTracker;
use std::collections::HashSet;

impl ChangeTracker {
    /// Accept every entry of a committed batch.
    ///
    /// Generated and propagated values are written onto the instances, the
    /// current values become the new originals, deleted entries are detached
    /// and everything else becomes `Unchanged`. Every entry is transitioned
    /// even if writing a value back fails; the first such failure is
    /// returned afterwards.
    #[tracing::instrument(level = "debug", skip(self, batch, result))]
    pub(crate) fn accept_batch(
        &mut self,
        batch: &CommandBatch,
        result: &ExecutionResult,
    ) -> Result<(), TrackerError> {
        let mut errors = Vec::new();
        let mut detached = 0usize;

        for &id in batch.entries() {
            let Some(record) = self.entries.get_mut(&id) else {
                continue;
            };
            if record.state == EntityState::Deleted {
                self.detach_entry(id);
                detached += 1;
                continue;
            }

            let written = result
                .generated
                .get(&id)
                .into_iter()
                .chain(result.propagated.get(&id))
                .flatten();
            for (column, value) in written {
                if let Err(e) = record.instance.write_column(column, value.clone()) {
                    errors.push(e);
                }
            }
            if let Err(e) = record.refresh_current() {
                errors.push(e);
            }
            record.accept_current();
            // Write-backs may have notified; they are not user changes.
            record.detection.drain();
            record.state = EntityState::Unchanged;

            if let Err(e) = self.rekey(id) {
                errors.push(e);
            }
        }

        let accepted: HashSet<_> = batch.entries().iter().copied().collect();
        self.links
            .retain(|(dependent, _), _| !accepted.contains(dependent));

        tracing::debug!(
            accepted = batch.entries().len() - detached,
            detached = detached,
            failures = errors.len(),
            "Batch accepted"
        );

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
