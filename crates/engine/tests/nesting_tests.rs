//! Nested transaction semantics
//!
//! Validates the rollback and callback guarantees of the speculative runtime:
//! 1. Write collapse and earliest-value restore across joins
//! 2. On-commit and on-abort ordering
//! 3. Untracked execution and manual nesting
//! 4. Cascading aborts, panics and callback re-entrancy

mod common;

use common::{assert_idle, runtime};
use proptest::prelude::*;
use rewind_engine::{
    AbortReason, HandlerKey, NestedTransaction, RetryPolicy, RewindError, Runtime, RuntimeConfig,
    RuntimeExt, Speculative, TxCell, TxResult, TxStatus,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

type EventLog = Rc<RefCell<Vec<&'static str>>>;

fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(log: &EventLog, name: &'static str) -> Box<dyn FnOnce()> {
    let log = log.clone();
    Box::new(move || log.borrow_mut().push(name))
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn test_repeated_writes_restore_pre_transaction_value() {
    let rt = runtime();
    let x = TxCell::new(5i64);
    let result = rt.transact(&mut || {
        for v in 0..100 {
            x.set(v);
        }
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 5);
    assert_idle(&rt);
}

#[test]
fn test_inner_commit_outer_abort_restores_value_before_inner() {
    let rt = runtime();
    let x = TxCell::new(5);
    let y = TxCell::new(10);
    let result = rt.transact(&mut || {
        x.set(1);
        let inner = rt.transact(&mut || {
            x.set(2);
            y.set(20);
            Ok(())
        });
        assert_eq!(inner, TxResult::Committed);
        assert_eq!((x.get(), y.get()), (2, 20));
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 5);
    assert_eq!(y.get(), 10);
}

#[test]
fn test_outermost_commit_is_final() {
    let rt = runtime();
    let x = TxCell::new(5);
    let result = rt.transact(&mut || {
        x.set(1);
        Ok(())
    });
    assert_eq!(result, TxResult::Committed);
    assert_eq!(x.get(), 1);

    // A later abort only undoes its own writes
    rt.transact(&mut || {
        x.set(3);
        Err(AbortReason::Request)
    });
    assert_eq!(x.get(), 1);
}

#[test]
fn test_inner_abort_keeps_outer_writes() {
    let rt = runtime();
    let x = TxCell::new(0);
    let result = rt.transact(&mut || {
        x.set(1);
        let inner = rt.transact(&mut || {
            x.set(2);
            Err(AbortReason::Request)
        });
        assert_eq!(inner, TxResult::AbortedByRequest);
        assert_eq!(x.get(), 1);
        Ok(())
    });
    assert_eq!(result, TxResult::Committed);
    assert_eq!(x.get(), 1);
}

#[test]
fn test_requested_abort_survives_nested_commit() {
    let rt = runtime();
    let x = TxCell::new(5);
    let result = rt.transact(&mut || {
        x.set(1);
        rt.request_abort(AbortReason::Request).unwrap();
        let inner = rt.transact(&mut || {
            // The outer level is still doomed while the inner one runs
            assert_eq!(rt.status(), TxStatus::AbortedByRequest);
            x.set(2);
            Ok(())
        });
        assert_eq!(inner, TxResult::Committed);
        assert_eq!(x.get(), 2);
        Ok(())
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 5);
    assert_idle(&rt);
}

#[test]
fn test_requested_abort_survives_manual_level_commit() {
    let rt = runtime();
    let x = TxCell::new(5);
    let result = rt.transact(&mut || {
        rt.request_abort(AbortReason::Request).unwrap();
        rt.start_transaction().unwrap();
        x.set(1);
        assert_eq!(rt.commit_transaction().unwrap(), TxResult::Committed);
        Ok(())
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 5);
}

#[test]
fn test_untracked_writes_survive_abort() {
    let rt = runtime();
    let tracked = TxCell::new(0);
    let untracked = TxCell::new(0);
    let result = rt.transact(&mut || {
        tracked.set(1);
        rt.run_untracked(&mut || {
            assert!(!rt.is_tracked());
            assert!(rt.is_transactional());
            untracked.set(1);
        });
        assert!(rt.is_tracked());
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(tracked.get(), 0);
    assert_eq!(untracked.get(), 1);
}

#[test]
fn test_run_tracked_inside_untracked_region() {
    let rt = runtime();
    let x = TxCell::new(0);
    let result = rt.transact_then_untracked(&mut || {
        let status = rt
            .run_tracked(&mut || {
                x.set(7);
                Ok(())
            })
            .unwrap();
        assert_eq!(status, TxStatus::OnTrack);
        assert!(!rt.is_tracked());
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 0);
}

#[test]
fn test_run_tracked_abort_becomes_pending() {
    let rt = runtime();
    let result = rt.transact(&mut || {
        let status = rt.run_tracked(&mut || Err(AbortReason::Request)).unwrap();
        assert_eq!(status, TxStatus::AbortedByRequest);
        Ok(())
    });
    assert_eq!(result, TxResult::AbortedByRequest);
}

// ============================================================================
// Callbacks
// ============================================================================

#[test]
fn test_abort_handlers_run_newest_first() {
    let rt = runtime();
    let log = event_log();
    let key = HandlerKey(1);
    rt.transact(&mut || {
        rt.push_on_abort_handler(key, record(&log, "h1"));
        rt.push_on_abort_handler(key, record(&log, "h2"));
        Err(AbortReason::Request)
    });
    assert_eq!(*log.borrow(), vec!["h2", "h1"]);
}

#[test]
fn test_popped_handler_does_not_run() {
    let rt = runtime();
    let log = event_log();
    let key = HandlerKey(1);
    rt.transact(&mut || {
        rt.push_on_abort_handler(key, record(&log, "h"));
        assert!(rt.pop_on_abort_handler(key));
        Err(AbortReason::Request)
    });
    assert!(log.borrow().is_empty());
}

#[test]
fn test_pop_in_inner_level_removes_outer_handler_on_join() {
    let rt = runtime();
    let log = event_log();
    let key = HandlerKey::of(&log);
    rt.transact(&mut || {
        rt.push_on_abort_handler(key, record(&log, "outer"));
        rt.transact(&mut || {
            assert!(!rt.pop_on_abort_handler(key));
            Ok(())
        });
        Err(AbortReason::Request)
    });
    assert!(log.borrow().is_empty());
}

#[test]
fn test_pop_in_aborted_inner_level_leaves_outer_handler() {
    let rt = runtime();
    let log = event_log();
    let key = HandlerKey(9);
    rt.transact(&mut || {
        rt.push_on_abort_handler(key, record(&log, "outer"));
        rt.transact(&mut || {
            rt.pop_all_on_abort_handlers(key);
            Err(AbortReason::Request)
        });
        Err(AbortReason::Request)
    });
    assert_eq!(*log.borrow(), vec!["outer"]);
}

#[test]
fn test_on_commit_runs_once_after_outermost_commit() {
    let rt = runtime();
    let log = event_log();
    rt.transact(&mut || {
        rt.transact(&mut || {
            rt.on_commit(record(&log, "commit"));
            Ok(())
        });
        assert!(log.borrow().is_empty());
        Ok(())
    });
    assert_eq!(*log.borrow(), vec!["commit"]);
}

#[test]
fn test_on_commit_never_runs_if_either_level_aborts() {
    let rt = runtime();
    let log = event_log();
    rt.transact(&mut || {
        rt.transact(&mut || {
            rt.on_commit(record(&log, "inner-aborted"));
            Err(AbortReason::Request)
        });
        Ok(())
    });
    rt.transact(&mut || {
        rt.transact(&mut || {
            rt.on_commit(record(&log, "outer-aborted"));
            Ok(())
        });
        Err(AbortReason::Request)
    });
    assert!(log.borrow().is_empty());
}

#[test]
fn test_on_commit_order_and_abort_callbacks() {
    let rt = runtime();
    let log = event_log();
    rt.transact(&mut || {
        rt.on_commit(record(&log, "first"));
        rt.on_abort(record(&log, "never"));
        rt.transact(&mut || {
            rt.on_commit(record(&log, "second"));
            Ok(())
        });
        rt.on_commit(record(&log, "third"));
        Ok(())
    });
    assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn test_commit_phase_is_visible_to_callbacks() {
    let rt = Rc::new(runtime());
    let seen = Rc::new(Cell::new(TxStatus::Idle));
    let (rt2, seen2) = (rt.clone(), seen.clone());
    rt.transact(&mut || {
        let (rt3, seen3) = (rt2.clone(), seen2.clone());
        rt2.on_commit(Box::new(move || {
            assert!(rt3.is_committing_or_aborting());
            seen3.set(rt3.status());
            assert!(matches!(
                rt3.request_abort(AbortReason::Request),
                Err(RewindError::AbortDuringCommit)
            ));
        }));
        Ok(())
    });
    assert_eq!(seen.get(), TxStatus::Committing);
    assert_idle(&*rt);
}

#[test]
fn test_transact_from_abort_handler_is_rejected() {
    let rt = Rc::new(runtime());
    let inner = Rc::new(Cell::new(None));
    let (rt2, inner2) = (rt.clone(), inner.clone());
    let result = rt.transact(&mut || {
        let (rt3, inner3) = (rt2.clone(), inner2.clone());
        rt2.on_abort(Box::new(move || {
            inner3.set(Some(rt3.transact(&mut || Ok(()))));
        }));
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(inner.get(), Some(TxResult::AbortedByTransactInOnAbort));
}

#[test]
fn test_request_abort_from_abort_handler_is_rejected() {
    let rt = Rc::new(runtime());
    let x = TxCell::new(5);
    let refused = Rc::new(Cell::new(false));
    let (rt2, refused2) = (rt.clone(), refused.clone());
    let result = rt.transact(&mut || {
        x.set(1);
        let (rt3, refused3) = (rt2.clone(), refused2.clone());
        let inner = rt2.transact(&mut || {
            let (rt4, refused4) = (rt3.clone(), refused3.clone());
            rt3.on_abort(Box::new(move || {
                refused4.set(matches!(
                    rt4.request_abort(AbortReason::Request),
                    Err(RewindError::AbortDuringAbort)
                ));
            }));
            Err(AbortReason::Request)
        });
        assert_eq!(inner, TxResult::AbortedByRequest);
        Ok(())
    });
    assert!(refused.get());
    // The handler's request must not leak onto the surviving outer level
    assert_eq!(result, TxResult::Committed);
    assert_eq!(x.get(), 1);
    assert_idle(&*rt);
}

#[test]
fn test_abort_current_from_commit_callback_panics() {
    let rt = Rc::new(runtime());
    let x = TxCell::new(5);
    let rt2 = rt.clone();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.transact(&mut || {
            x.set(1);
            let rt3 = rt2.clone();
            rt2.on_commit(Box::new(move || {
                let _ = rt3.abort_current::<()>(AbortReason::Request);
            }));
            Ok(())
        })
    }));
    assert!(caught.is_err());
    // The commit had already happened
    assert_eq!(x.get(), 1);
    assert_idle(&*rt);
}

#[test]
fn test_with_abort_handler_scope() {
    let rt = runtime();
    let log = event_log();
    rt.transact(&mut || {
        rt.with_abort_handler(HandlerKey(3), record(&log, "kept"), || {
            rt.abort_current::<()>(AbortReason::Request)
        })
    });
    rt.transact(&mut || {
        rt.with_abort_handler(HandlerKey(4), record(&log, "popped"), || Ok(()))?;
        Err(AbortReason::Request)
    });
    assert_eq!(*log.borrow(), vec!["kept"]);
}

#[test]
fn test_keep_alive_releases_on_resolution() {
    let rt = runtime();
    let owner = Arc::new(String::from("host object"));
    rt.transact(&mut || {
        assert!(rt.keep_alive(owner.clone()));
        assert_eq!(Arc::strong_count(&owner), 2);
        Ok(())
    });
    assert_eq!(Arc::strong_count(&owner), 1);
}

// ============================================================================
// Manual nesting
// ============================================================================

#[test]
fn test_manual_commit_without_parent_is_error() {
    let rt = runtime();
    assert!(matches!(
        rt.commit_transaction(),
        Err(RewindError::NoActiveTransaction)
    ));
    assert!(matches!(
        rt.start_transaction(),
        Err(RewindError::NoActiveTransaction)
    ));
    assert_idle(&rt);
}

#[test]
fn test_manual_levels_join_and_abort() {
    let rt = runtime();
    let x = TxCell::new(5);
    let result = rt.transact(&mut || {
        x.set(1);
        rt.start_transaction().unwrap();
        x.set(2);
        assert_eq!(rt.commit_transaction().unwrap(), TxResult::Committed);
        Err(AbortReason::Request)
    });
    assert_eq!(result, TxResult::AbortedByRequest);
    assert_eq!(x.get(), 5);
}

#[test]
fn test_manual_commit_with_pending_abort_reports_abort() {
    let rt = runtime();
    let x = TxCell::new(0);
    rt.transact(&mut || {
        let nested = NestedTransaction::begin(&rt).unwrap();
        x.set(1);
        rt.request_abort(AbortReason::Request).unwrap();
        assert_eq!(nested.commit().unwrap(), TxResult::AbortedByRequest);
        assert_eq!(x.get(), 0);
        assert_eq!(rt.status(), TxStatus::OnTrack);
        Ok(())
    });
}

#[test]
fn test_clear_status_cancels_pending_abort() {
    let rt = runtime();
    let x = TxCell::new(0);
    let result = rt.transact(&mut || {
        x.set(1);
        rt.request_abort(AbortReason::Request).unwrap();
        rt.clear_status();
        Ok(())
    });
    assert_eq!(result, TxResult::Committed);
    assert_eq!(x.get(), 1);
}

// ============================================================================
// Cascade, panics, retry
// ============================================================================

#[test]
fn test_cascade_aborts_every_level() {
    let rt = runtime();
    let x = TxCell::new(0);
    let results = RefCell::new(Vec::new());
    let outer = rt.transact(&mut || {
        x.set(1);
        let middle = rt.transact(&mut || {
            x.set(2);
            let inner = rt.transact(&mut || {
                x.set(3);
                rt.abort_current(AbortReason::Cascade)
            });
            results.borrow_mut().push(inner);
            // The middle level tries to commit anyway
            Ok(())
        });
        results.borrow_mut().push(middle);
        Ok(())
    });
    results.borrow_mut().push(outer);
    assert_eq!(*results.borrow(), vec![TxResult::AbortedByCascade; 3]);
    assert_eq!(x.get(), 0);
    assert_eq!(rt.status(), TxStatus::Idle);
    assert_idle(&rt);
}

#[test]
fn test_panic_rolls_back_and_resumes_unwinding() {
    let rt = runtime();
    let x = TxCell::new(5);
    let log = event_log();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.transact(&mut || {
            x.set(1);
            rt.on_abort(record(&log, "aborted"));
            rt.start_transaction().unwrap();
            x.set(2);
            panic!("boom");
        })
    }));
    assert!(caught.is_err());
    assert_eq!(x.get(), 5);
    assert_eq!(*log.borrow(), vec!["aborted"]);
    assert_idle(&rt);
}

#[test]
fn test_retry_policy_reruns_outermost_once() {
    let rt = Speculative::new(
        RuntimeConfig::default().with_retry(RetryPolicy::AbortAndRetryOutermost),
    );
    let x = TxCell::new(0);
    let runs = Cell::new(0);
    let result = rt.transact(&mut || {
        runs.set(runs.get() + 1);
        x.update(|v| *v += 1);
        rt.transact(&mut || {
            x.update(|v| *v += 10);
            Ok(())
        });
        Ok(())
    });
    assert_eq!(result, TxResult::Committed);
    assert_eq!(runs.get(), 2);
    // The first run was rolled back completely
    assert_eq!(x.get(), 11);
    assert_eq!(rt.metrics().total_retried, 1);
}

#[test]
fn test_commit_or_die_commits() {
    let rt = runtime();
    let x = TxCell::new(0);
    rt.commit_or_die(&mut || {
        x.set(4);
        Ok(())
    });
    assert_eq!(x.get(), 4);
}

#[test]
fn test_transact_with_value() {
    let rt = runtime();
    let x = TxCell::new(2);
    let outcome = rt.transact_with(|| {
        x.update(|v| *v *= 21);
        Ok(x.get())
    });
    assert_eq!(outcome.committed(), Some(42));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_outer_abort_restores_every_cell(
        writes in proptest::collection::vec((0usize..4, 0usize..3, any::<i32>()), 0..48),
    ) {
        let rt = Speculative::default();
        let cells: Vec<TxCell<i32>> = (0..4).map(TxCell::new).collect();
        let result = rt.transact(&mut || {
            for &(idx, depth, value) in &writes {
                // Write at 0, 1 or 2 extra committed nesting levels
                let mut levels = 0;
                while levels < depth {
                    rt.start_transaction().unwrap();
                    levels += 1;
                }
                cells[idx].set(value);
                while levels > 0 {
                    rt.commit_transaction().unwrap();
                    levels -= 1;
                }
            }
            Err(AbortReason::Request)
        });
        prop_assert_eq!(result, TxResult::AbortedByRequest);
        for (i, cell) in cells.iter().enumerate() {
            prop_assert_eq!(cell.get(), i as i32);
        }
    }
}
