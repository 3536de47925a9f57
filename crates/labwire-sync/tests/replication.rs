use labwire_codec::Value;
use labwire_sync::{
    apply_mod, Broadcaster, Error, FixedDelay, Notifier, Publisher, Receiver, Subscriber,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn experiment() -> Notifier {
    Notifier::new(Value::map([
        ("points", Value::List(vec![])),
        ("state", Value::from("idle")),
    ]))
}

#[tokio::test]
async fn subscriber_follows_the_publisher() {
    let master = experiment();
    let publisher = Publisher::new()
        .with("experiment", master.clone())
        .bind("127.0.0.1:0", None)
        .await
        .unwrap();
    let port = publisher.local_addr().port();

    let actions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&actions);
    let subscription = Subscriber::new("experiment")
        .on_notify(move |m, _| seen.lock().unwrap().push(m.action()))
        .connect("127.0.0.1", port)
        .await
        .unwrap();
    assert_eq!(subscription.replica(), master.raw_view());

    master.root().set("state", "running").unwrap();
    for i in 0..10 {
        master.at(["points"]).append(i).unwrap();
    }
    master.at(["points"]).pop(0).unwrap();
    master.at(["points"]).insert(-1, "marker").unwrap();

    eventually("replica to converge", || subscription.replica() == master.raw_view()).await;
    let actions = actions.lock().unwrap().clone();
    assert_eq!(actions.first(), Some(&"init"));
    assert_eq!(actions.len(), 1 + 1 + 10 + 2);

    subscription.close().await;
    publisher.stop().await;
}

#[tokio::test]
async fn unknown_notifier_is_reported() {
    let publisher = Publisher::new()
        .with("experiment", experiment())
        .bind("127.0.0.1:0", None)
        .await
        .unwrap();
    let port = publisher.local_addr().port();

    let err = Subscriber::new("nope").connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTarget(ref name) if name == "nope"));
    publisher.stop().await;
}

#[tokio::test]
async fn reconnection_restarts_from_a_fresh_snapshot() {
    let master = experiment();
    let publisher = Publisher::new()
        .with("experiment", master.clone())
        .bind("127.0.0.1:0", None)
        .await
        .unwrap();
    let addr = publisher.local_addr();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let inits = Arc::new(AtomicUsize::new(0));
    let (d, i) = (Arc::clone(&disconnects), Arc::clone(&inits));
    let subscription = Subscriber::new("experiment")
        .on_notify(move |m, _| {
            if m.action() == "init" {
                i.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .reconnect(FixedDelay(Duration::from_millis(20)))
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();

    publisher.stop().await;
    eventually("disconnect callback", || disconnects.load(Ordering::SeqCst) == 1).await;
    assert!(!subscription.is_connected());

    // Changes made while nobody listens arrive with the next snapshot.
    master.at(["points"]).append(1).unwrap();
    master.root().set("state", "done").unwrap();

    let publisher = Publisher::new()
        .with("experiment", master.clone())
        .bind(addr, None)
        .await
        .unwrap();
    eventually("reconnection", || inits.load(Ordering::SeqCst) == 2).await;
    master.at(["points"]).append(2).unwrap();
    eventually("replica to converge", || subscription.replica() == master.raw_view()).await;
    assert!(subscription.is_connected());

    subscription.close().await;
    publisher.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_subscriber_is_disconnected_without_blocking_the_master() {
    let master = Notifier::new(Value::List(vec![]));
    let publisher = Publisher::new()
        .with("log", master.clone())
        .queue_capacity(4)
        .bind("127.0.0.1:0", None)
        .await
        .unwrap();
    let port = publisher.local_addr().port();

    let disconnected = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disconnected);
    let subscription = Subscriber::new("log")
        .on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .connect("127.0.0.1", port)
        .await
        .unwrap();

    // The publisher task cannot run during this loop, so its queue overflows.
    for i in 0..100_000 {
        master.root().append(i).unwrap();
    }
    assert_eq!(master.read(|v| v.as_seq().map(<[Value]>::len)), Some(100_000));
    eventually("slow subscriber to be dropped", || disconnected.load(Ordering::SeqCst) == 1).await;

    drop(subscription);
    publisher.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_receivers_of_the_channel() {
    let broadcaster = Broadcaster::new();
    let listener = broadcaster.bind("127.0.0.1:0", None).await.unwrap();
    let port = listener.local_addr().port();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let receiver = Receiver::new("log")
        .on_notify(move |obj| sink.lock().unwrap().push(obj.clone()))
        .connect("127.0.0.1", port)
        .await
        .unwrap();
    eventually("receiver registration", || broadcaster.receiver_count("log") == 1).await;

    broadcaster.broadcast("log", &Value::from("hello"));
    broadcaster.broadcast("other", &Value::from("ignored"));
    broadcaster.broadcast("log", &Value::from(vec![1, 2]));

    eventually("objects", || received.lock().unwrap().len() == 2).await;
    assert_eq!(
        *received.lock().unwrap(),
        vec![Value::from("hello"), Value::from(vec![1, 2])]
    );

    receiver.close().await;
    listener.stop().await;
}

#[derive(Debug, Clone)]
enum Op {
    Set(i64, i64),
    Delete(i64),
    Append(i64),
    Insert(i64, i64),
    Pop(i64),
    Remove(i64),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..8, any::<i64>()).prop_map(|(k, v)| Op::Set(k, v)),
        (0i64..8).prop_map(Op::Delete),
        any::<i64>().prop_map(Op::Append),
        (-10i64..10, 0i64..4).prop_map(|(i, x)| Op::Insert(i, x)),
        (-6i64..6).prop_map(Op::Pop),
        (0i64..4).prop_map(Op::Remove),
        Just(Op::Clear),
    ]
}

fn mixed() -> Notifier {
    Notifier::new(Value::map([
        ("map", Value::Dict(Default::default())),
        ("list", Value::List(vec![])),
    ]))
}

fn apply(master: &Notifier, op: &Op) {
    let map = master.at(["map"]);
    let list = master.at(["list"]);
    // Mutations that do not apply are rejected and never published.
    let _ = match *op {
        Op::Set(k, v) => map.set(k, v),
        Op::Delete(k) => map.delete(k),
        Op::Append(x) => list.append(x),
        Op::Insert(i, x) => list.insert(i, x),
        Op::Pop(i) => list.pop(i).map(drop),
        Op::Remove(x) => list.remove(x),
        Op::Clear => list.clear(),
    };
}

/// Runs `ops` against a published notifier and waits for a subscriber's
/// replica to match it.
async fn replicate_over_the_network(ops: &[Op]) {
    let master = mixed();
    let publisher = Publisher::new()
        .with("mixed", master.clone())
        .bind("127.0.0.1:0", None)
        .await
        .unwrap();
    let subscription = Subscriber::new("mixed")
        .connect("127.0.0.1", publisher.local_addr().port())
        .await
        .unwrap();

    for op in ops {
        apply(&master, op);
    }
    eventually("replica to converge", || subscription.replica() == master.raw_view()).await;
    assert_eq!(subscription.replica(), master.read(Value::clone));

    subscription.close().await;
    publisher.stop().await;
}

#[tokio::test]
async fn fixed_sequences_replicate_over_the_network() {
    let sequences = [
        vec![Op::Append(1), Op::Append(2), Op::Insert(-1, 3), Op::Pop(0), Op::Remove(3)],
        vec![Op::Set(1, 10), Op::Set(2, 20), Op::Delete(1), Op::Set(2, 21), Op::Delete(7)],
        vec![Op::Append(5), Op::Clear, Op::Insert(4, 1), Op::Pop(-1), Op::Pop(3), Op::Append(6)],
        vec![Op::Insert(-10, 0), Op::Insert(10, 1), Op::Set(0, 0), Op::Remove(2), Op::Clear, Op::Delete(0)],
    ];
    for ops in &sequences {
        replicate_over_the_network(ops).await;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn prop_network_replica_matches_master(ops in proptest::collection::vec(op(), 0..48)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(replicate_over_the_network(&ops));
    }
}

proptest! {
    #[test]
    fn prop_replica_matches_master(ops in proptest::collection::vec(op(), 0..64)) {
        let master = mixed();
        let (mut replica, mut mods) = master.attach(1024);

        for op in &ops {
            apply(&master, op);
        }
        while let Ok(m) = mods.try_recv() {
            apply_mod(&mut replica, &m).unwrap();
        }
        prop_assert_eq!(replica, master.raw_view());
    }
}
