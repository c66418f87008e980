//! Integration Tests for the Signal Graph
//!
//! These tests verify that states, computeds, async derivations, watchers
//! and scopes work together correctly through the public API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use trellis_core::{
    with_contexts, AsyncComputed, AsyncDerived, Computed, Context, Derived, Equality, Error,
    ListenOptions, MemoryStore, RecordingTracer, Relay, RelayHooks, Runtime, RuntimeConfig,
    SignalKind, State, Task, TraceEvent, Watcher,
};

fn counter() -> Rc<Cell<u32>> {
    Rc::new(Cell::new(0))
}

fn bump(runs: &Cell<u32>) {
    runs.set(runs.get() + 1);
}

/// Test the basic count/double chain: one compute per change.
#[tokio::test]
async fn double_recomputes_once_per_change() {
    let count = State::new(0);
    let runs = counter();
    let double = Computed::new({
        let (count, runs) = (count.clone(), runs.clone());
        move || {
            bump(&runs);
            count.get() * 2
        }
    });

    assert_eq!(double.get(), 0);
    assert_eq!(runs.get(), 1);

    count.set(5);
    Runtime::settled().await;
    assert_eq!(double.get(), 10);
    assert_eq!(runs.get(), 2);
}

/// Test that a derived function is not re-invoked for equal arguments.
#[test]
fn derived_memoizes_structurally_equal_arguments() {
    let runs = counter();
    let total = Derived::new({
        let runs = runs.clone();
        move |items: &Vec<u32>| {
            bump(&runs);
            Ok(items.iter().sum::<u32>())
        }
    });

    assert_eq!(total.get(vec![1, 2, 3]), 6);
    assert_eq!(total.get(vec![1, 2, 3]), 6);
    assert_eq!(runs.get(), 1);

    assert_eq!(total.get(vec![4]), 4);
    assert_eq!(runs.get(), 2);
}

/// Test that a diamond recomputes its bottom exactly once.
#[tokio::test]
async fn diamond_dependencies_recompute_once() {
    let a = State::new(1);
    let b = Computed::new({
        let a = a.clone();
        move || a.get() + 1
    });
    let c = Computed::new({
        let a = a.clone();
        move || a.get() * 2
    });
    let runs = counter();
    let d = Computed::new({
        let (b, c, runs) = (b.clone(), c.clone(), runs.clone());
        move || {
            bump(&runs);
            b.get() + c.get()
        }
    });

    assert_eq!(d.get(), 4);
    a.set(2);
    Runtime::settled().await;
    assert_eq!(d.get(), 7);
    assert_eq!(runs.get(), 2);
}

/// Test that writes made before a flush are handled in one batch.
#[tokio::test]
async fn writes_before_a_flush_are_batched() {
    let a = State::new(1);
    let b = State::new(2);
    let runs = counter();
    let sum = Watcher::new({
        let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
        move || {
            bump(&runs);
            a.get() + b.get()
        }
    });
    let calls = Rc::new(RefCell::new(Vec::new()));
    let _listener = sum.listen(
        {
            let calls = calls.clone();
            move |value| calls.borrow_mut().push(value.unwrap())
        },
        ListenOptions::default(),
    );
    Runtime::settled().await;
    assert_eq!(runs.get(), 1);

    a.set(10);
    b.set(20);
    Runtime::settled().await;
    assert_eq!(runs.get(), 2);
    assert_eq!(*calls.borrow(), vec![30]);
}

/// Test that an equal write dirties nothing.
#[tokio::test]
async fn equal_writes_cause_no_work() {
    let name = State::new(String::from("ada"));
    let runs = counter();
    let upper = Computed::new({
        let (name, runs) = (name.clone(), runs.clone());
        move || {
            bump(&runs);
            name.get().to_uppercase()
        }
    });
    let watcher = Watcher::new({
        let upper = upper.clone();
        move || upper.get()
    });
    let calls = counter();
    let _listener = watcher.listen(
        {
            let calls = calls.clone();
            move |_| bump(&calls)
        },
        ListenOptions::default(),
    );
    Runtime::settled().await;

    name.set(String::from("ada"));
    Runtime::settled().await;
    assert_eq!(upper.get(), "ADA");
    assert_eq!(runs.get(), 1);
    assert_eq!(calls.get(), 0);
}

/// Test that custom equality decides what counts as a change.
#[tokio::test]
async fn custom_equality_suppresses_propagation() {
    let reading = State::with_equality(
        20.0_f64,
        Equality::custom(|a: &f64, b: &f64| (a - b).abs() < 0.5),
    );
    let runs = counter();
    let display = Computed::new({
        let (reading, runs) = (reading.clone(), runs.clone());
        move || {
            bump(&runs);
            format!("{:.0}", reading.get())
        }
    });

    assert_eq!(display.get(), "20");
    reading.set(20.2);
    assert_eq!(display.get(), "20");
    assert_eq!(runs.get(), 1);

    reading.set(21.0);
    assert_eq!(display.get(), "21");
    assert_eq!(runs.get(), 2);
}

/// Test that an outer async derivation sees the inner result, and that new
/// outer calls reuse the cached inner signal.
#[tokio::test]
async fn nested_async_derivations_share_inner_results() {
    let base = State::new(10);
    let inner_runs = counter();
    let inner = AsyncComputed::new({
        let (base, inner_runs) = (base.clone(), inner_runs.clone());
        move || {
            bump(&inner_runs);
            let base = base.get();
            async move {
                tokio::task::yield_now().await;
                Ok(base)
            }
        }
    });
    let outer = AsyncDerived::new({
        let inner = inner.clone();
        move |offset: &u32| {
            let (inner, offset) = (inner.clone(), *offset);
            async move { Ok(inner.wait().await? + offset) }
        }
    });

    assert_eq!(outer.wait(1).await, Ok(11));
    assert_eq!(outer.wait(2).await, Ok(12));
    assert_eq!(inner_runs.get(), 1);

    base.set(20);
    assert_eq!(outer.wait(1).await, Ok(21));
    assert_eq!(inner_runs.get(), 2);
}

/// Test that async failures are captured, never thrown out of the loop.
#[tokio::test]
async fn async_failures_stay_in_the_result() {
    let fail = State::new(true);
    let fetch = AsyncComputed::new({
        let fail = fail.clone();
        move || {
            let fail = fail.get();
            async move {
                if fail {
                    Err(Error::msg("unreachable host"))
                } else {
                    Ok(1)
                }
            }
        }
    });

    assert_eq!(fetch.wait().await, Err(Error::msg("unreachable host")));
    Runtime::settled().await;
    assert!(fetch.get().is_error());

    fail.set(false);
    assert_eq!(fetch.wait().await, Ok(1));
    assert!(fetch.get().is_ready());
}

/// Test that only the latest task run is applied.
#[tokio::test]
async fn stale_task_runs_are_discarded() {
    let gates: Rc<RefCell<Vec<tokio::sync::oneshot::Sender<()>>>> = Rc::default();
    let save = Task::new({
        let gates = gates.clone();
        move |draft: String| {
            let (tx, rx) = tokio::sync::oneshot::channel();
            gates.borrow_mut().push(tx);
            async move {
                let _ = rx.await;
                Ok(draft)
            }
        }
    });

    save.run("first".into());
    save.run("second".into());
    for gate in gates.borrow_mut().drain(..).rev() {
        let _ = gate.send(());
    }
    Runtime::settled().await;
    assert_eq!(save.get().value().map(String::as_str), Some("second"));
}

/// Test that a computed writing its own dependency is rejected.
#[test]
fn writing_a_consumed_state_is_a_cycle() {
    let count = State::new(0);
    let runaway = Computed::try_new({
        let count = count.clone();
        move || {
            let value = count.get();
            count.try_set(value + 1)?;
            Ok(value)
        }
    });

    let err = runaway.try_get().unwrap_err();
    assert!(err.is_cycle());
}

/// Test that a computed reading itself is rejected.
#[test]
fn self_reads_are_a_cycle() {
    let slot: Rc<RefCell<Option<Computed<u32>>>> = Rc::default();
    let looped = Computed::try_new({
        let slot = slot.clone();
        move || match slot.borrow().as_ref() {
            Some(me) => me.try_get().map(|value| value + 1),
            None => Ok(0),
        }
    });
    *slot.borrow_mut() = Some(looped.clone());

    assert!(looped.try_get().unwrap_err().is_cycle());
    slot.borrow_mut().take();
}

/// Test that a derivation moves to the scope providing a context it starts reading.
#[test]
fn context_reads_promote_to_the_providing_scope() {
    let locale = Context::new("en");
    let localized = State::new(false);
    let runs = counter();
    let greet = Derived::new({
        let (locale, localized, runs) = (locale.clone(), localized.clone(), runs.clone());
        move |name: &String| {
            bump(&runs);
            Ok(match localized.get() {
                true => format!("{name} ({})", locale.get()),
                false => name.clone(),
            })
        }
    });
    let french = || locale.provide("fr");

    // no context read yet, so the root owns the signal and the child shares it
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada");
    assert_eq!(greet.get("ada".into()), "ada");
    assert_eq!(runs.get(), 1);

    localized.set(true);
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada (fr)");
    assert_eq!(greet.get("ada".into()), "ada (en)");
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada (fr)");
    assert_eq!(runs.get(), 3);
}

fn localized_greeting(
    locale: &Context<&'static str>,
    localized: &State<bool>,
    runs: &Rc<Cell<u32>>,
) -> Derived<String, String> {
    let (locale, localized, runs) = (locale.clone(), localized.clone(), runs.clone());
    Derived::new(move |name: &String| {
        bump(&runs);
        Ok(match localized.get() {
            true => format!("{name} ({})", locale.get()),
            false => name.clone(),
        })
    })
}

/// Test a signal created at the root and shared with a child scope before
/// it read any context: once it does, the child gets its own signal.
#[tokio::test]
async fn root_signals_stop_serving_children_that_override_a_new_context() {
    let locale = Context::new("en");
    let localized = State::new(false);
    let runs = counter();
    let greet = localized_greeting(&locale, &localized, &runs);
    let french = || locale.provide("fr");

    assert_eq!(greet.get("ada".into()), "ada");
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada");
    assert_eq!(runs.get(), 1);

    localized.set(true);
    Runtime::settled().await;
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada (fr)");
    assert_eq!(greet.get("ada".into()), "ada (en)");
    assert_eq!(with_contexts([french()], || greet.get("ada".into())), "ada (fr)");
    assert_eq!(runs.get(), 3);
}

/// Test a watcher in a child scope that holds on to a root signal which
/// starts reading a context the child overrides.
#[tokio::test]
async fn child_watchers_move_off_outgrown_root_signals() {
    let locale = Context::new("en");
    let localized = State::new(false);
    let runs = counter();
    let greet = localized_greeting(&locale, &localized, &runs);
    assert_eq!(greet.get("ada".into()), "ada");

    let watcher = with_contexts([locale.provide("fr")], || {
        let greet = greet.clone();
        Watcher::new(move || greet.get("ada".into()))
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _listener = watcher.listen(
        {
            let seen = seen.clone();
            move |value| seen.borrow_mut().push(value)
        },
        ListenOptions::default(),
    );
    Runtime::settled().await;
    assert_eq!(watcher.get(), Ok(String::from("ada")));
    assert_eq!(runs.get(), 1);

    localized.set(true);
    Runtime::settled().await;
    assert_eq!(*seen.borrow(), vec![Ok(String::from("ada (fr)"))]);
    assert_eq!(greet.get("ada".into()), "ada (en)");
    assert_eq!(runs.get(), 3);
}

/// Test unwatch teardown and the idle sweep.
#[tokio::test]
async fn unwatched_derivations_are_swept_after_teardown() {
    let teardowns = counter();
    let feed = Relay::new({
        let teardowns = teardowns.clone();
        move |set| {
            set.set(1u32);
            let teardowns = teardowns.clone();
            RelayHooks::new().on_deactivate(move || bump(&teardowns))
        }
    });
    let label = Derived::new({
        let feed = feed.clone();
        move |prefix: &String| Ok(format!("{prefix}{:?}", feed.get().value()))
    });
    let watcher = Watcher::new({
        let label = label.clone();
        move || label.get("feed: ".into())
    });

    let listener = watcher.listen(|_| {}, ListenOptions::default());
    Runtime::settled().await;
    assert!(feed.is_active());
    assert_eq!(watcher.get(), Ok(String::from("feed: Some(1)")));

    drop(listener);
    Runtime::settled().await;
    assert!(!feed.is_active());
    assert_eq!(teardowns.get(), 1);
    assert!(label.is_cached(&"feed: ".into()));

    assert_eq!(Runtime::run_idle(), 1);
    assert!(!label.is_cached(&"feed: ".into()));
    assert_eq!(teardowns.get(), 1);
}

/// Test that a signal watched again before the sweep stays cached.
#[tokio::test]
async fn rewatching_before_the_sweep_keeps_the_cache() {
    let base = State::new(2);
    let square = Derived::new({
        let base = base.clone();
        move |_: &()| Ok(base.get() * base.get())
    });
    let watcher = Watcher::new({
        let square = square.clone();
        move || square.get(())
    });

    let listener = watcher.listen(|_| {}, ListenOptions::default());
    Runtime::settled().await;
    drop(listener);
    Runtime::settled().await;

    let _listener = watcher.listen(|_| {}, ListenOptions::default());
    Runtime::settled().await;
    Runtime::run_idle();
    assert!(square.is_cached(&()));
}

/// Test persisted states against an in-memory store.
#[test]
fn persisted_states_round_trip_through_the_store() {
    let store = Rc::new(MemoryStore::new());
    Runtime::builder().store(store.clone()).install();

    let theme = State::persisted("theme", String::from("light"));
    assert_eq!(theme.get(), "light");
    assert!(store.is_empty());

    theme.set(String::from("dark"));
    assert!(store.contains("theme"));

    let reloaded = State::persisted("theme", String::from("light"));
    assert_eq!(reloaded.get(), "dark");
}

/// Test that an installed tracer receives the graph's lifecycle events.
#[tokio::test]
async fn tracer_receives_lifecycle_events() {
    let tracer = Rc::new(RecordingTracer::new());
    Runtime::builder().tracer(tracer.clone()).install();

    let count = State::new(1);
    let double = Computed::new({
        let count = count.clone();
        move || count.get() * 2
    });
    assert_eq!(double.get(), 2);
    count.set(2);
    Runtime::settled().await;

    let (count_id, double_id) = (count.id().to_raw(), double.id().to_raw());
    let events = tracer.events();
    assert!(events.contains(&TraceEvent::Created {
        id: double_id,
        kind: SignalKind::Computed,
    }));
    assert!(events.contains(&TraceEvent::Consumed {
        consumer: double_id,
        dep: count_id,
    }));
    assert!(events
        .iter()
        .any(|event| matches!(event, TraceEvent::Updated { id, .. } if *id == count_id)));
    assert!(tracer.to_json().unwrap().contains("\"event\":\"consumed\""));
}

/// Test the tokio host: flushes and sweeps run without anyone awaiting them.
#[tokio::test]
async fn tokio_host_flushes_and_sweeps_by_itself() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = RuntimeConfig::from_json(r#"{ "gc_idle_delay_ms": 1 }"#).unwrap();
            Runtime::builder().config(config).tokio_host().install();

            let count = State::new(0);
            let parity = Derived::new({
                let count = count.clone();
                move |_: &()| Ok(count.get() % 2)
            });
            let watcher = Watcher::new({
                let parity = parity.clone();
                move || parity.get(())
            });
            let seen = Rc::new(RefCell::new(Vec::new()));
            let listener = watcher.listen(
                {
                    let seen = seen.clone();
                    move |value| seen.borrow_mut().push(value.unwrap())
                },
                ListenOptions::default(),
            );
            tokio::time::sleep(Duration::from_millis(10)).await;

            count.set(1);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(*seen.borrow(), vec![1]);

            drop(listener);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!parity.is_cached(&()));
        })
        .await;
}
