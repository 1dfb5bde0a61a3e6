//! Key-ordered dispatcher: ordering, concurrency, reclaim and shutdown

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use transfer_outbox::dispatch::{
    DispatchError, FailureObserver, KeyedDispatcher, LaneTaskFailure,
};

#[derive(Default)]
struct CollectingObserver {
    failures: Mutex<Vec<LaneTaskFailure>>,
}

impl FailureObserver for CollectingObserver {
    fn on_failure(&self, failure: &LaneTaskFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_order_matches_submission_order() {
    const KEYS: usize = 8;
    const PER_KEY: usize = 50;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let dispatcher = KeyedDispatcher::new(4);
    let seen: Arc<Mutex<HashMap<String, Vec<usize>>>> = Arc::new(Mutex::new(HashMap::new()));

    // Random interleaving of keys, labels increasing within each key
    let mut next_label = vec![0usize; KEYS];
    let mut remaining = KEYS * PER_KEY;
    while remaining > 0 {
        let k = rng.gen_range(0..KEYS);
        if next_label[k] == PER_KEY {
            continue;
        }
        let label = next_label[k];
        next_label[k] += 1;
        remaining -= 1;

        let key = format!("order{k}");
        let yields = rng.gen_range(0..4);
        let seen = seen.clone();
        let lane_key = key.clone();
        dispatcher
            .submit(&key, async move {
                for _ in 0..yields {
                    tokio::task::yield_now().await;
                }
                seen.lock().unwrap().entry(lane_key).or_default().push(label);
                Ok(())
            })
            .unwrap();
    }

    dispatcher.wait_idle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), KEYS);
    for (key, labels) in seen.iter() {
        assert_eq!(*labels, (0..PER_KEY).collect::<Vec<_>>(), "lane {key} out of order");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_run_concurrently() {
    let dispatcher = KeyedDispatcher::new(2);
    let (key2_done_tx, key2_done_rx) = oneshot::channel::<()>();
    let (key1_done_tx, key1_done_rx) = oneshot::channel::<()>();

    // key1 cannot finish until key2 ran
    dispatcher
        .submit("key1", async move {
            key2_done_rx.await?;
            let _ = key1_done_tx.send(());
            Ok(())
        })
        .unwrap();
    dispatcher
        .submit("key2", async move {
            let _ = key2_done_tx.send(());
            Ok(())
        })
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), key1_done_rx)
        .await
        .expect("key2 was blocked behind key1")
        .unwrap();
    dispatcher.wait_idle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reclaim_never_drops_busy_lanes() {
    const KEYS: usize = 4;
    const TASKS: usize = 2_000;

    let dispatcher = Arc::new(KeyedDispatcher::new(4));
    let in_use: Arc<Vec<AtomicBool>> = Arc::new((0..KEYS).map(|_| AtomicBool::new(false)).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let reclaimers: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut removed = 0;
                while !stop.load(Ordering::SeqCst) {
                    removed += dispatcher.reclaim();
                    tokio::task::yield_now().await;
                }
                removed
            })
        })
        .collect();

    for i in 0..TASKS {
        let k = i % KEYS;
        let in_use = in_use.clone();
        let overlaps = overlaps.clone();
        let completed = completed.clone();
        dispatcher
            .submit(&format!("k{k}"), async move {
                if in_use[k].swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
                in_use[k].store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        if i % 64 == 0 {
            tokio::task::yield_now().await;
        }
    }

    dispatcher.wait_idle().await;
    stop.store(true, Ordering::SeqCst);
    for reclaimer in reclaimers {
        reclaimer.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(completed.load(Ordering::SeqCst), TASKS);
    dispatcher.reclaim();
    assert_eq!(dispatcher.lane_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_orders_keep_their_own_sequence() {
    let dispatcher = KeyedDispatcher::new(4);
    let log = Arc::new(Mutex::new(Vec::new()));

    for (key, amount) in [("order1", 100u64), ("order1", 50), ("order2", 10)] {
        let log = log.clone();
        dispatcher
            .submit(key, async move {
                log.lock().unwrap().push((key, amount));
                Ok(())
            })
            .unwrap();
    }
    dispatcher.wait_idle().await;

    let log = log.lock().unwrap();
    let order1: Vec<u64> = log.iter().filter(|(k, _)| *k == "order1").map(|(_, a)| *a).collect();
    let order2: Vec<u64> = log.iter().filter(|(k, _)| *k == "order2").map(|(_, a)| *a).collect();
    assert_eq!(order1, vec![100, 50]);
    assert_eq!(order2, vec![10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_task_does_not_stop_the_lane() {
    let observer = Arc::new(CollectingObserver::default());
    let dispatcher = KeyedDispatcher::new(2).with_observer(observer.clone());
    let after = Arc::new(AtomicBool::new(false));

    dispatcher
        .submit("order1", async { panic!("handler exploded") })
        .unwrap();
    let ran = after.clone();
    dispatcher
        .submit("order1", async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    dispatcher.wait_idle().await;

    assert!(after.load(Ordering::SeqCst));
    let failures = observer.failures.lock().unwrap();
    assert_eq!(
        *failures,
        vec![LaneTaskFailure::Panicked {
            key: "order1".into(),
            message: "handler exploded".into()
        }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_queued_work_and_refuses_new() {
    let dispatcher = KeyedDispatcher::new(1);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let ran = Arc::new(AtomicUsize::new(0));

    dispatcher
        .submit("a", async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();
    started_rx.await.unwrap();

    for key in ["a", "a", "a", "b", "b"] {
        let ran = ran.clone();
        dispatcher
            .submit(key, async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    let report = dispatcher.shutdown(Duration::from_millis(50)).await;

    assert!(!report.drained);
    assert_eq!(report.abandoned, 5);
    assert_eq!(report.still_running, 1);
    assert_eq!(
        dispatcher.submit("c", async { Ok(()) }),
        Err(DispatchError::ShuttingDown)
    );

    release_tx.send(()).unwrap();
    dispatcher.wait_idle().await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drained_shutdown_runs_every_accepted_task() {
    for _ in 0..50 {
        let dispatcher = Arc::new(KeyedDispatcher::new(4));
        let ran = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..4)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                let ran = ran.clone();
                tokio::spawn(async move {
                    let key = format!("order{i}");
                    let mut accepted = 0;
                    loop {
                        let ran = ran.clone();
                        let submitted = dispatcher.submit(&key, async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        match submitted {
                            Ok(()) => accepted += 1,
                            Err(_) => return accepted,
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        let report = dispatcher.shutdown(Duration::from_secs(5)).await;
        let ran_at_shutdown = ran.load(Ordering::SeqCst);

        let mut accepted = 0;
        for submitter in submitters {
            accepted += submitter.await.unwrap();
        }

        // Nothing accepted may be left over once shutdown reports drained
        assert!(report.drained);
        assert_eq!(accepted, ran_at_shutdown);
        assert_eq!(ran.load(Ordering::SeqCst), ran_at_shutdown);
        assert_eq!(dispatcher.pending(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn reclaimer_sweeps_idle_lanes_until_shutdown() {
    let dispatcher = Arc::new(KeyedDispatcher::new(2));
    let reclaimer = dispatcher.spawn_reclaimer(Duration::from_secs(30));

    for key in ["order1", "order2", "order3"] {
        dispatcher.submit(key, async { Ok(()) }).unwrap();
    }
    dispatcher.wait_idle().await;
    assert_eq!(dispatcher.lane_count(), 3);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(dispatcher.lane_count(), 0);

    let report = dispatcher.shutdown(Duration::from_millis(10)).await;
    assert!(report.drained);
    tokio::time::timeout(Duration::from_secs(60), reclaimer)
        .await
        .expect("reclaimer kept running after shutdown")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn reclaimer_stops_when_dispatcher_dropped() {
    let dispatcher = Arc::new(KeyedDispatcher::new(2));
    let reclaimer = dispatcher.spawn_reclaimer(Duration::from_secs(30));

    drop(dispatcher);
    tokio::time::timeout(Duration::from_secs(60), reclaimer)
        .await
        .expect("reclaimer kept running after drop")
        .unwrap();
}
