use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use spark_probe::{
    Binding, EventContext, ExecutionListener, GuestValue, HookResult, Probe, ProbeServices,
    SourceLocation,
    test_stubs::{NoopReporter, RecordingHost, StaticChainBuilder},
};

use crate::support::{Journal, ScriptedFactory};

const THREADS: usize = 8;
const ROUNDS: usize = 200;

#[derive(Default)]
struct Balance {
    entered: AtomicUsize,
    returned: AtomicUsize,
}

impl ExecutionListener for Balance {
    fn on_enter(&self, _ctx: &EventContext<'_>) -> HookResult {
        self.entered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_return_value(&self, _ctx: &EventContext<'_>, _result: &GuestValue) -> HookResult {
        self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn probe_is_shareable_across_threads() {
    assert_send_sync::<Probe>();
    assert_send_sync::<spark_probe::ExecutionFault>();
    assert_send_sync::<Binding>();
}

#[test]
fn concurrent_executions_keep_enter_and_return_balanced() {
    let balance = Arc::new(Balance::default());
    let builder = Arc::new(StaticChainBuilder::new([
        Binding::listener("balance", balance.clone()).into_shared()
    ]));
    let services = ProbeServices::new(builder.clone(), Arc::new(RecordingHost::default()))
        .with_reporter(Arc::new(NoopReporter));
    let probe = Arc::new(Probe::new(SourceLocation::new("hot.gs", 1, 1), services));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let probe = Arc::clone(&probe);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let expected = (worker * ROUNDS + round) as i64;
                    let value = probe
                        .execute(|| Ok(GuestValue::Int(expected)))
                        .expect("no faults expected");
                    assert_eq!(value.as_int(), Some(expected));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    let total = THREADS * ROUNDS;
    assert_eq!(balance.entered.load(Ordering::SeqCst), total);
    assert_eq!(balance.returned.load(Ordering::SeqCst), total);
    assert_eq!(builder.calls(), 1, "并发首次派发只重建一次");
}

#[test]
fn rebuilds_racing_with_dispatch_dispose_every_replaced_handler_exactly_once() {
    let journal = Journal::default();
    let factory = Arc::new(ScriptedFactory::new("h", &journal));
    let builder = Arc::new(StaticChainBuilder::new([
        Binding::factory("h", factory.clone()).into_shared()
    ]));
    let reporter = Arc::new(spark_probe::test_stubs::RecordingReporter::default());
    let services = ProbeServices::new(builder.clone(), Arc::new(RecordingHost::default()))
        .with_reporter(reporter.clone());
    let probe = Arc::new(Probe::new(SourceLocation::new("swap.gs", 1, 1), services));
    let stop = Arc::new(AtomicBool::new(false));

    let invalidator = {
        let probe = Arc::clone(&probe);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                probe.invalidate();
                thread::yield_now();
            }
        })
    };
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let probe = Arc::clone(&probe);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    probe
                        .execute(|| Ok(GuestValue::Int(1)))
                        .expect("no faults expected");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread panicked");
    }
    stop.store(true, Ordering::SeqCst);
    invalidator.join().expect("invalidator panicked");

    assert!(reporter.is_empty(), "重复释放会以 panic 形式被上报: {:?}", reporter.reports());
    assert_eq!(
        factory.created(),
        factory.disposed() + 1,
        "除当前发布的链路外，所有处理器都已释放"
    );
    assert_eq!(probe.epoch() as usize, factory.created());
}
