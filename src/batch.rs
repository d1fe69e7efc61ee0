//! Batch write orchestration shared by the backend adapters.
//!
//! Adapters drive one native operation per item through a [`BatchRunner`],
//! which collects per-index results instead of aborting on the first error.
//! The configured policy decides whether a failing item halts the loop, and
//! [`BatchRunner::finalize`] turns the collected outcome into either the
//! success list or one aggregate error carrying per-index context.

use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult, BatchContext};
use crate::models::Record;
use crate::options::RequestOptions;

/// Failure policy for one batch call, resolved from the request options and
/// the request shape.
///
/// `rollback` and `continue` are mutually exclusive in effect: rollback
/// implies fail-fast with compensation, so it wins when both are set. A
/// single-record request always fails fast with a plain error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub single: bool,
    pub native_batch: bool,
    pub rollback: bool,
    pub continue_on_error: bool,
}

impl BatchPolicy {
    pub fn resolve(record_count: usize, opts: &RequestOptions) -> BatchPolicy {
        BatchPolicy {
            single: record_count <= 1,
            native_batch: opts.use_native_batch,
            rollback: opts.rollback,
            continue_on_error: opts.continue_on_error && !opts.rollback,
        }
    }

    /// Does an item failure end the loop?
    pub fn halts_on_error(&self) -> bool {
        self.single || self.native_batch || self.rollback || !self.continue_on_error
    }
}

/// What the adapter loop should do after reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Halt,
}

/// Per-item result accumulator for one batch call.
pub struct BatchRunner {
    policy: BatchPolicy,
    total: usize,
    results: Vec<Result<Record, ApiError>>,
}

impl BatchRunner {
    pub fn new(total: usize, policy: BatchPolicy) -> Self {
        Self {
            policy,
            total,
            results: Vec::with_capacity(total),
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    pub fn succeed(&mut self, record: Record) {
        self.results.push(Ok(record));
    }

    pub fn fail(&mut self, err: ApiError) -> StepControl {
        self.results.push(Err(err));
        if self.policy.halts_on_error() {
            StepControl::Halt
        } else {
            StepControl::Continue
        }
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.is_err())
    }

    /// Convert the collected outcome into the success list or an aggregate
    /// error. `action` is the past-tense verb for the top-level message
    /// ("created", "updated", "patched", "deleted").
    pub fn finalize(self, action: &str) -> ApiResult<Vec<Record>> {
        if !self.has_failures() {
            return Ok(self
                .results
                .into_iter()
                .map(|r| r.expect("no failures recorded"))
                .collect());
        }

        // Single-record requests and native batch calls surface the backend
        // error as-is; there is no partial result to report.
        if self.policy.single || self.policy.native_batch {
            for result in self.results {
                if let Err(err) = result {
                    return Err(err);
                }
            }
            unreachable!("has_failures was true");
        }

        let mut failed = Vec::new();
        let mut records = Vec::with_capacity(self.total);
        for (index, result) in self.results.into_iter().enumerate() {
            match result {
                Ok(record) => records.push(Value::Object(record)),
                Err(err) => {
                    failed.push(index);
                    records.push(json!({ "error": err.to_string() }));
                }
            }
        }
        // Items never reached after a halt.
        while records.len() < self.total {
            records.push(Value::Null);
        }

        Err(ApiError::Batch(BatchContext {
            message: format!(
                "Batch Error: Not all requested records could be {}.",
                action
            ),
            failed,
            records,
        }))
    }
}

/// Compensating operations captured at write time, undone in reverse order.
pub struct RollbackJournal<E> {
    entries: Vec<E>,
}

impl<E> RollbackJournal<E> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: E) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in undo order (most recent write first).
    pub fn drain_reversed(&mut self) -> Vec<E> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }
}

impl<E> Default for RollbackJournal<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Annotate the surfaced error after a completed compensation pass. The
/// original error stays what the caller sees; only the message gains the
/// rollback notice.
pub fn mark_rolled_back(err: ApiError) -> ApiError {
    const NOTICE: &str = " All changes rolled back.";
    match err {
        ApiError::Batch(mut ctx) => {
            ctx.message.push_str(NOTICE);
            ApiError::Batch(ctx)
        }
        ApiError::BadRequest(mut msg) => {
            msg.push_str(NOTICE);
            ApiError::BadRequest(msg)
        }
        ApiError::NotFound(mut msg) => {
            msg.push_str(NOTICE);
            ApiError::NotFound(msg)
        }
        ApiError::Forbidden(mut msg) => {
            msg.push_str(NOTICE);
            ApiError::Forbidden(msg)
        }
        ApiError::Database(mut msg) => {
            msg.push_str(NOTICE);
            ApiError::Database(msg)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), json!(id));
        r
    }

    fn opts(rollback: bool, cont: bool) -> RequestOptions {
        RequestOptions {
            rollback,
            continue_on_error: cont,
            ..Default::default()
        }
    }

    #[test]
    fn test_policy_rollback_wins_over_continue() {
        let policy = BatchPolicy::resolve(3, &opts(true, true));
        assert!(policy.rollback);
        assert!(!policy.continue_on_error);
        assert!(policy.halts_on_error());
    }

    #[test]
    fn test_policy_single_record() {
        let policy = BatchPolicy::resolve(1, &opts(false, true));
        assert!(policy.single);
        assert!(policy.halts_on_error());
    }

    #[test]
    fn test_continue_collects_all_failures() {
        let policy = BatchPolicy::resolve(4, &opts(false, true));
        let mut runner = BatchRunner::new(4, policy);
        runner.succeed(record(0));
        assert_eq!(
            runner.fail(ApiError::BadRequest("one".into())),
            StepControl::Continue
        );
        runner.succeed(record(2));
        assert_eq!(
            runner.fail(ApiError::BadRequest("three".into())),
            StepControl::Continue
        );
        match runner.finalize("created").unwrap_err() {
            ApiError::Batch(ctx) => {
                assert_eq!(ctx.failed, vec![1, 3]);
                assert_eq!(ctx.records.len(), 4);
                assert_eq!(ctx.records[0]["id"], json!(0));
                assert!(ctx.records[1]["error"].as_str().unwrap().contains("one"));
            }
            other => panic!("Expected Batch error, got {:?}", other),
        }
    }

    #[test]
    fn test_fail_fast_pads_unprocessed() {
        let policy = BatchPolicy::resolve(3, &opts(false, false));
        let mut runner = BatchRunner::new(3, policy);
        runner.succeed(record(0));
        assert_eq!(
            runner.fail(ApiError::BadRequest("boom".into())),
            StepControl::Halt
        );
        match runner.finalize("created").unwrap_err() {
            ApiError::Batch(ctx) => {
                assert_eq!(ctx.failed, vec![1]);
                assert_eq!(ctx.records.len(), 3);
                assert!(ctx.records[2].is_null());
            }
            other => panic!("Expected Batch error, got {:?}", other),
        }
    }

    #[test]
    fn test_single_record_error_is_plain() {
        let policy = BatchPolicy::resolve(1, &opts(false, false));
        let mut runner = BatchRunner::new(1, policy);
        runner.fail(ApiError::NotFound("gone".into()));
        assert!(matches!(
            runner.finalize("deleted").unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[test]
    fn test_success_order_preserved() {
        let policy = BatchPolicy::resolve(2, &opts(false, false));
        let mut runner = BatchRunner::new(2, policy);
        runner.succeed(record(7));
        runner.succeed(record(8));
        let out = runner.finalize("created").unwrap();
        assert_eq!(out[0]["id"], json!(7));
        assert_eq!(out[1]["id"], json!(8));
    }

    #[test]
    fn test_journal_reversed() {
        let mut journal = RollbackJournal::new();
        journal.push(1);
        journal.push(2);
        journal.push(3);
        assert_eq!(journal.drain_reversed(), vec![3, 2, 1]);
        assert!(journal.is_empty());
    }

    #[test]
    fn test_mark_rolled_back_appends_notice() {
        let err = mark_rolled_back(ApiError::BadRequest("boom".into()));
        assert!(err.to_string().contains("All changes rolled back."));
    }
}
