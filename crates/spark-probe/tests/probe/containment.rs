use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use spark_probe::{
    Binding, EventContext, ExecutionFault, ExecutionHandler, ExecutionHandlerFactory, GuestValue,
    HookError, HookResult, Probe, ProbeSettings,
    error::codes,
    observability::operation,
};

use crate::support::{
    Harness, Journal, Script, ScriptedFactory, ScriptedListener, expect_int, strings,
};

#[test]
fn untrusted_failure_is_reported_and_traversal_continues() {
    let journal = Journal::default();
    let broken = ScriptedListener::new("broken", &journal)
        .on_enter(Script::Fail)
        .bind()
        .into_shared();
    let bindings = vec![
        ScriptedListener::new("a", &journal).bind().into_shared(),
        broken.clone(),
        ScriptedListener::new("c", &journal).bind().into_shared(),
    ];
    let harness = Harness::new(bindings);

    expect_int(harness.run(&journal, 3), 3);

    assert_eq!(
        journal.entries(),
        strings(&[
            "enter:a", "enter:broken", "enter:c", "body", "return:c", "return:broken", "return:a",
        ])
    );
    let reports = harness.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].binding, broken.id());
    assert_eq!(reports[0].operation, operation::ON_ENTER);
    assert_eq!(reports[0].code, codes::OBSERVER_FAILED);
    assert!(reports[0].message.contains("broken failed in enter"));
}

#[test]
fn untrusted_panic_is_caught_and_reported() {
    let journal = Journal::default();
    let bindings = vec![
        ScriptedListener::new("panicky", &journal)
            .on_return_value(Script::Panic)
            .bind()
            .into_shared(),
        ScriptedListener::new("steady", &journal).bind().into_shared(),
    ];
    let harness = Harness::new(bindings);

    expect_int(harness.run(&journal, 11), 11);

    assert_eq!(harness.reporter.codes(), vec![codes::OBSERVER_PANICKED]);
    assert_eq!(harness.reporter.reports()[0].operation, operation::ON_RETURN_VALUE);
    assert!(harness.reporter.reports()[0].message.contains("panicky panicked"));
    assert_eq!(
        journal.with_prefix("return:"),
        strings(&["return:steady", "return:panicky"])
    );
}

#[test]
fn untrusted_panic_escapes_when_catching_is_disabled() {
    let journal = Journal::default();
    let settings = ProbeSettings {
        catch_observer_panics: false,
        ..ProbeSettings::default()
    };
    let harness = Harness::with_settings(
        vec![
            ScriptedListener::new("panicky", &journal)
                .on_enter(Script::Panic)
                .bind()
                .into_shared(),
        ],
        settings,
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| harness.run(&journal, 1)));

    assert!(outcome.is_err(), "panic 应当直接穿透探针");
    assert!(harness.reporter.is_empty());
}

#[test]
fn untrusted_guest_exception_cannot_change_guest_semantics() {
    let journal = Journal::default();
    let harness = Harness::new(vec![
        ScriptedListener::new("meddler", &journal)
            .on_enter(Script::Guest("injected"))
            .bind()
            .into_shared(),
    ]);

    expect_int(harness.run(&journal, 4), 4);

    assert_eq!(harness.reporter.codes(), vec![codes::GUEST_EXCEPTION]);
    assert_eq!(harness.reporter.reports()[0].message, "injected");
}

#[test]
fn trusted_failure_propagates_and_aborts_the_traversal() {
    let journal = Journal::default();
    let strict = ScriptedListener::new("strict", &journal)
        .on_enter(Script::Fail)
        .bind()
        .trusted()
        .into_shared();
    let bindings = vec![
        ScriptedListener::new("a", &journal).bind().into_shared(),
        strict.clone(),
        ScriptedListener::new("c", &journal).bind().into_shared(),
    ];
    let harness = Harness::new(bindings);

    let fault = harness.run(&journal, 1).unwrap_err();

    match fault {
        ExecutionFault::Observer(fault) => {
            assert_eq!(fault.binding(), strict.id());
            assert_eq!(fault.operation(), operation::ON_ENTER);
            assert_eq!(fault.error().code(), codes::OBSERVER_FAILED);
        }
        other => panic!("expected trusted observer fault, got {other:?}"),
    }
    assert_eq!(
        journal.entries(),
        strings(&[
            "enter:a",
            "enter:strict",
            "exceptional:c",
            "exceptional:strict",
            "exceptional:a",
        ]),
        "可信失败中止进入遍历，执行体不运行，异常通知照常派发"
    );
    assert!(harness.reporter.is_empty());
}

#[test]
fn trusted_guest_exception_replaces_the_result() {
    let journal = Journal::default();
    let harness = Harness::new(vec![
        ScriptedListener::new("language", &journal)
            .on_return_value(Script::Guest("type error"))
            .bind()
            .trusted()
            .into_shared(),
    ]);

    let fault = harness.run(&journal, 1).unwrap_err();

    assert!(matches!(fault, ExecutionFault::Guest(ref exception) if exception.message() == "type error"));
    assert!(
        journal.with_prefix("exceptional:").is_empty(),
        "返回通知已发出，不再派发异常通知"
    );
}

#[test]
fn fatal_signal_bypasses_containment_and_dispatch() {
    let journal = Journal::default();
    let harness = Harness::new(vec![
        ScriptedListener::new("a", &journal).bind().into_shared(),
        ScriptedListener::new("teardown", &journal)
            .on_enter(Script::Fatal)
            .bind()
            .into_shared(),
        ScriptedListener::new("c", &journal).bind().into_shared(),
    ]);

    let fault = harness.run(&journal, 1).unwrap_err();

    assert!(fault.is_fatal());
    assert!(harness.reporter.is_empty(), "致命信号不经过边界上报");
    assert_eq!(journal.entries(), strings(&["enter:a", "enter:teardown"]));
}

#[test]
fn untrusted_factory_failure_omits_the_node() {
    let journal = Journal::default();
    let factory = Arc::new(ScriptedFactory::new("flaky", &journal).on_create(Script::Fail));
    let flaky = Binding::factory("flaky", factory.clone()).into_shared();
    let harness = Harness::new(vec![
        flaky.clone(),
        ScriptedListener::new("steady", &journal).bind().into_shared(),
    ]);

    expect_int(harness.run(&journal, 2), 2);

    let labels: Vec<_> = harness
        .probe
        .chain_snapshot()
        .into_iter()
        .map(|entry| entry.label)
        .collect();
    assert_eq!(labels, vec!["steady".to_owned()]);
    let reports = harness.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].binding, flaky.id());
    assert_eq!(reports[0].operation, operation::HANDLER_FACTORY_CREATE);
    assert!(harness.probe.lookup_handler(flaky.id()).is_none());
}

#[test]
fn trusted_factory_failure_fails_the_rebuild_and_discards_partial_handlers() {
    let journal = Journal::default();
    let healthy = Arc::new(ScriptedFactory::new("healthy", &journal));
    let broken = Arc::new(ScriptedFactory::new("broken", &journal).on_create(Script::Fail));
    let harness = Harness::new(vec![
        Binding::factory("healthy", healthy.clone()).into_shared(),
        Binding::factory("broken", broken.clone()).trusted().into_shared(),
    ]);

    let fault = harness.run(&journal, 1).unwrap_err();

    match fault {
        ExecutionFault::Observer(fault) => {
            assert_eq!(fault.operation(), operation::HANDLER_FACTORY_CREATE)
        }
        other => panic!("expected trusted factory fault, got {other:?}"),
    }
    assert!(!harness.probe.is_attached());
    assert!(healthy.created() >= 1);
    assert_eq!(
        healthy.created(),
        healthy.disposed(),
        "未发布的处理器必须全部释放"
    );
    assert!(journal.with_prefix("body").is_empty());
}

/// 处理器在首次释放时重新进入所属探针。
#[derive(Default)]
struct Reentry {
    probe: Mutex<Weak<Probe>>,
    reentered: AtomicBool,
    nested_faulted: AtomicBool,
    created: AtomicUsize,
    disposed: AtomicUsize,
}

struct ReentrantFactory(Arc<Reentry>);

impl ExecutionHandlerFactory for ReentrantFactory {
    fn create(&self, _ctx: &EventContext<'_>) -> Result<Arc<dyn ExecutionHandler>, HookError> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ReentrantHandler(Arc::clone(&self.0))))
    }
}

struct ReentrantHandler(Arc<Reentry>);

impl ExecutionHandler for ReentrantHandler {
    fn on_dispose(&self, _ctx: &EventContext<'_>) -> HookResult {
        self.0.disposed.fetch_add(1, Ordering::SeqCst);
        if self.0.reentered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let probe = self.0.probe.lock().upgrade();
        if let Some(probe) = probe {
            let nested = probe.on_enter();
            self.0.nested_faulted.store(nested.is_err(), Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn discarded_handlers_may_reenter_from_on_dispose() {
    let journal = Journal::default();
    let reentry = Arc::new(Reentry::default());
    let broken = Arc::new(ScriptedFactory::new("broken", &journal).on_create(Script::Fail));
    let harness = Harness::new(vec![
        Binding::factory("reentrant", Arc::new(ReentrantFactory(reentry.clone()))).into_shared(),
        Binding::factory("broken", broken).trusted().into_shared(),
    ]);
    *reentry.probe.lock() = Arc::downgrade(&harness.probe);

    let probe = Arc::clone(&harness.probe);
    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        let _ = done.send(probe.execute(|| Ok(GuestValue::Int(1))));
    });
    let outcome = finished
        .recv_timeout(Duration::from_secs(5))
        .expect("on_dispose re-entry deadlocked on the rebuild lock");

    match outcome {
        Err(ExecutionFault::Observer(fault)) => {
            assert_eq!(fault.operation(), operation::HANDLER_FACTORY_CREATE)
        }
        other => panic!("expected trusted factory fault, got {other:?}"),
    }
    assert!(reentry.nested_faulted.load(Ordering::SeqCst), "重入的重建同样失败");
    assert!(reentry.created.load(Ordering::SeqCst) >= 2);
    assert_eq!(
        reentry.created.load(Ordering::SeqCst),
        reentry.disposed.load(Ordering::SeqCst),
        "重入产生的处理器同样被释放"
    );
    assert!(!harness.probe.is_attached());
}

#[test]
fn untrusted_unwind_from_factory_is_reported_as_nested() {
    let journal = Journal::default();
    let factory = Arc::new(ScriptedFactory::new("eager", &journal).on_create(Script::Unwind(1)));
    let harness = Harness::new(vec![Binding::factory("eager", factory).into_shared()]);

    expect_int(harness.run(&journal, 6), 6);

    assert_eq!(harness.reporter.codes(), vec![codes::NESTED_UNWIND]);
    assert_eq!(harness.host.detach_count(), 1, "唯一的节点被省略后探针被摘除");
}
