use std::sync::Arc;

use spark_probe::{Binding, ExecutionFault};

use crate::support::{Harness, Journal, ScriptedFactory, ScriptedListener, expect_int, strings};

/// 优先级 [1,2,3] 的监听器：进入按 1,2,3，返回按 3,2,1。
#[test]
fn enter_runs_head_to_tail_and_return_runs_tail_to_head() {
    let journal = Journal::default();
    // 以乱序注册，构建器按优先级排序。
    let bindings = vec![
        ScriptedListener::new("p3", &journal).bind().with_priority(3).into_shared(),
        ScriptedListener::new("p1", &journal).bind().with_priority(1).into_shared(),
        ScriptedListener::new("p2", &journal).bind().with_priority(2).into_shared(),
    ];
    let harness = Harness::new(bindings);

    expect_int(harness.run(&journal, 5), 5);

    assert_eq!(
        journal.entries(),
        strings(&[
            "enter:p1", "enter:p2", "enter:p3", "body", "return:p3", "return:p2", "return:p1",
        ])
    );
}

#[test]
fn exceptional_notifications_run_tail_to_head() {
    let journal = Journal::default();
    let bindings = vec![
        ScriptedListener::new("a", &journal).bind().into_shared(),
        ScriptedListener::new("b", &journal).bind().into_shared(),
    ];
    let harness = Harness::new(bindings);

    let fault = harness.run_failing(&journal).unwrap_err();

    assert!(matches!(fault, ExecutionFault::Guest(ref exception) if exception.message() == "guest failure"));
    assert_eq!(
        journal.entries(),
        strings(&["enter:a", "enter:b", "body", "exceptional:b", "exceptional:a"])
    );
}

#[test]
fn listeners_and_handlers_share_one_ordered_chain() {
    let journal = Journal::default();
    let factory = Arc::new(ScriptedFactory::new("h", &journal));
    let bindings = vec![
        ScriptedListener::new("first", &journal).bind().with_priority(0).into_shared(),
        Binding::factory("h", factory.clone()).with_priority(1).trusted().into_shared(),
        ScriptedListener::new("last", &journal).bind().with_priority(2).into_shared(),
    ];
    let harness = Harness::new(bindings);

    expect_int(harness.run(&journal, 1), 1);

    assert_eq!(
        journal.entries(),
        strings(&[
            "enter:first", "enter:h#1", "enter:last", "body", "return:last", "return:h#1",
            "return:first",
        ])
    );
    let snapshot = harness.probe.chain_snapshot();
    let kinds: Vec<_> = snapshot.iter().map(|entry| entry.kind).collect();
    assert_eq!(kinds, vec!["listener", "handler", "listener"]);
    let labels: Vec<_> = snapshot.iter().map(|entry| entry.label.as_str()).collect();
    assert_eq!(labels, vec!["first", "h", "last"]);
    assert!(snapshot[1].trusted);
    assert_eq!(factory.created(), 1);
}

#[test]
fn probe_without_observers_runs_body_and_detaches_once() {
    let journal = Journal::default();
    let harness = Harness::new(Vec::new());

    expect_int(harness.run(&journal, 9), 9);
    expect_int(harness.run(&journal, 10), 10);

    assert_eq!(journal.entries(), strings(&["body", "body"]));
    assert_eq!(harness.host.detach_count(), 1);
    assert_eq!(harness.host.detached(), vec![harness.probe.id()]);
    assert_eq!(harness.builder.calls(), 1, "有效的空快照不应重复重建");
    assert!(!harness.probe.is_attached());
    assert!(harness.probe.chain_snapshot().is_empty());
}

#[test]
fn event_context_exposes_location_and_binding() {
    use spark_probe::{EventContext, ExecutionListener, HookResult, SourceLocation};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Inspect(Mutex<Vec<String>>);

    impl ExecutionListener for Inspect {
        fn on_enter(&self, ctx: &EventContext<'_>) -> HookResult {
            self.0.lock().push(format!(
                "{} {} {}",
                ctx.location(),
                ctx.binding().label(),
                ctx.probe_id()
            ));
            Ok(())
        }
    }

    let inspect = Arc::new(Inspect::default());
    let harness = Harness::at(
        SourceLocation::new("inspect.gs", 7, 3),
        vec![Binding::listener("inspector", inspect.clone()).into_shared()],
        Default::default(),
    );

    harness
        .probe
        .on_enter()
        .expect("enter without faults");

    let seen = inspect.0.lock().clone();
    assert_eq!(
        seen,
        vec![format!("inspect.gs:7:3 inspector {}", harness.probe.id())]
    );
}
