//! End-to-end tests for reconciliation, publication and notification

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use mockall::{mock, Sequence};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use orderbook_engine::{
    BookListener, Classification, DepthVwapParams, EngineConfig, LevelUpdate, OrderBookEngine,
    OrderBookState, SequenceState, TickSize,
};

mock! {
    pub Listener {}

    impl BookListener for Listener {
        fn on_best_bid_changed(
            &self,
            instrument: &str,
            price: Decimal,
            size: Decimal,
            timestamp: u64,
        ) -> anyhow::Result<()>;
        fn on_best_ask_changed(
            &self,
            instrument: &str,
            price: Decimal,
            size: Decimal,
            timestamp: u64,
        ) -> anyhow::Result<()>;
        fn on_imbalance_changed(
            &self,
            instrument: &str,
            value: f64,
            timestamp: u64,
        ) -> anyhow::Result<()>;
        fn on_book_snapshot(&self, book: &OrderBookState, timestamp: u64) -> anyhow::Result<()>;
    }
}

fn engine_with_btc(tick: Decimal) -> OrderBookEngine {
    let engine = OrderBookEngine::new(EngineConfig::default()).unwrap();
    engine
        .register_instrument("BTC-X", TickSize::new(tick).unwrap())
        .unwrap();
    engine
}

#[test]
fn test_snapshot_delta_stale_scenario() {
    let engine = engine_with_btc(dec!(0.5));

    let snapshot = LevelUpdate::new("BTC-X")
        .with_nonces(0, 100)
        .with_timestamp(1)
        .bid(dec!(100.30), dec!(2.0))
        .ask(dec!(100.80), dec!(1.0));
    assert_eq!(engine.apply(&snapshot), Classification::Snapshot);

    let book = engine.book("BTC-X").unwrap();
    assert!(book.is_initialized());
    assert_eq!(book.best_bid().price, dec!(100.0));
    assert_eq!(book.best_bid().size, dec!(2.0));
    assert_eq!(book.best_ask().price, dec!(101.0));
    assert_eq!(book.midpoint(), dec!(100.5));

    let delta = LevelUpdate::new("BTC-X")
        .with_nonces(100, 101)
        .with_timestamp(2)
        .bid(dec!(100.10), dec!(1.5));
    assert_eq!(engine.apply(&delta), Classification::Delta);

    let after_delta = engine.book("BTC-X").unwrap();
    assert_eq!(after_delta.best_bid().price, dec!(100.0));
    assert_eq!(after_delta.best_bid().size, dec!(3.5));

    let stale = LevelUpdate::new("BTC-X")
        .with_nonces(10, 20)
        .with_timestamp(3)
        .bid(dec!(99.0), dec!(50.0))
        .ask(dec!(100.80), dec!(0));
    assert_eq!(engine.apply(&stale), Classification::Stale);

    let after_stale = engine.book("BTC-X").unwrap();
    assert_eq!(*after_stale, *after_delta);
    assert!(Arc::ptr_eq(&after_stale, &after_delta));

    engine.shutdown();
}

#[test]
fn test_nonce_monotonicity() {
    let engine = engine_with_btc(dec!(1));
    let n = 500;
    engine.apply(
        &LevelUpdate::new("BTC-X")
            .with_nonces(0, n)
            .bid(dec!(100), dec!(1))
            .bid(dec!(99), dec!(1))
            .ask(dec!(101), dec!(1)),
    );

    let next = LevelUpdate::new("BTC-X").with_nonces(n, n + 1).bid(dec!(98), dec!(1));
    assert_eq!(engine.apply(&next), Classification::Delta);

    let before = engine.book("BTC-X").unwrap();
    let duplicate = LevelUpdate::new("BTC-X").with_nonces(n + 1, n + 1).bid(dec!(97), dec!(1));
    assert_eq!(engine.apply(&duplicate), Classification::Stale);
    let older = LevelUpdate::new("BTC-X").with_nonces(n + 1, n).bid(dec!(96), dec!(1));
    assert_eq!(engine.apply(&older), Classification::Stale);
    assert_eq!(*engine.book("BTC-X").unwrap(), *before);

    let gap = LevelUpdate::new("BTC-X")
        .with_nonces(n + 51, n + 52)
        .bid(dec!(90), dec!(7))
        .ask(dec!(95), dec!(3));
    assert_eq!(engine.apply(&gap), Classification::Reset);

    let book = engine.book("BTC-X").unwrap();
    assert_eq!(book.bids(usize::MAX).len(), 1);
    assert_eq!(book.asks(usize::MAX).len(), 1);
    assert_eq!(book.best_bid().price, dec!(90));
    assert_eq!(book.best_ask().price, dec!(95));
    assert_eq!(
        engine.sequence_state("BTC-X"),
        Some(SequenceState::Synced {
            last_nonce: Some(n + 52)
        })
    );

    engine.shutdown();
}

#[test]
fn test_repeated_snapshot_after_clear_is_idempotent() {
    let engine = engine_with_btc(dec!(0.5));
    let snapshot = LevelUpdate::new("BTC-X")
        .with_nonces(0, 10)
        .bid(dec!(100.30), dec!(2.0))
        .bid(dec!(100.10), dec!(1.0))
        .ask(dec!(100.80), dec!(1.0));

    engine.apply(&snapshot);
    let first = engine.book("BTC-X").unwrap();
    engine.clear("BTC-X").unwrap();
    assert_eq!(engine.apply(&snapshot), Classification::Snapshot);
    let second = engine.book("BTC-X").unwrap();

    assert_eq!(*first, *second);
    assert_eq!(second.best_bid().size, dec!(3.0));
    engine.shutdown();
}

#[test]
fn test_failing_listener_does_not_block_others() {
    let engine = engine_with_btc(dec!(0.5));

    let mut failing = MockListener::new();
    failing
        .expect_on_best_bid_changed()
        .returning(|_, _, _, _| Err(anyhow!("bid hook failed")));
    failing
        .expect_on_best_ask_changed()
        .returning(|_, _, _, _| panic!("ask hook panicked"));
    failing
        .expect_on_imbalance_changed()
        .returning(|_, _, _| Err(anyhow!("imbalance hook failed")));
    failing
        .expect_on_book_snapshot()
        .returning(|_, _| Err(anyhow!("snapshot hook failed")));

    let mut healthy = MockListener::new();
    healthy
        .expect_on_best_bid_changed()
        .withf(|instrument, price, size, _| {
            instrument.to_string() == "BTC-X" && *price == dec!(100.0) && *size == dec!(2.0)
        })
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    healthy
        .expect_on_best_ask_changed()
        .withf(|_, price, _, _| *price == dec!(101.0))
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    healthy.expect_on_imbalance_changed().never();
    healthy
        .expect_on_book_snapshot()
        .withf(|book, timestamp| book.is_initialized() && *timestamp == 42)
        .times(1)
        .returning(|_, _| Ok(()));

    engine.subscribe(Arc::new(failing));
    engine.subscribe(Arc::new(healthy));

    let snapshot = LevelUpdate::new("BTC-X")
        .with_nonces(0, 1)
        .with_timestamp(42)
        .bid(dec!(100.30), dec!(2.0))
        .ask(dec!(100.80), dec!(1.0));
    assert_eq!(engine.apply(&snapshot), Classification::Snapshot);

    // Drains the pool, so every callback has run; the mock checks its
    // expectations when the engine drops it
    engine.shutdown();

    let book = engine.book("BTC-X").unwrap();
    assert_eq!(book.best_bid().price, dec!(100.0));
    assert_eq!(engine.metrics().listener_failures(), 3);
}

#[test]
fn test_unsubscribed_listener_is_not_called() {
    let engine = engine_with_btc(dec!(1));

    let mut listener = MockListener::new();
    listener.expect_on_best_bid_changed().never();
    listener.expect_on_best_ask_changed().never();
    listener.expect_on_book_snapshot().never();

    let id = engine.subscribe(Arc::new(listener));
    assert!(engine.unsubscribe(id));

    engine.apply(&LevelUpdate::new("BTC-X").with_nonces(0, 1).bid(dec!(100), dec!(1)));
    engine.shutdown();

    // A call on a `never()` expectation panics inside the isolated dispatch
    assert_eq!(engine.metrics().listener_failures(), 0);
}

#[test]
fn test_writers_on_different_instruments_run_in_parallel() {
    let engine = Arc::new(OrderBookEngine::new(EngineConfig::default()).unwrap());
    let instruments = ["AAA", "BBB", "CCC", "DDD"];

    let handles: Vec<_> = instruments
        .iter()
        .map(|instrument| {
            let engine = engine.clone();
            let instrument = instrument.to_string();
            thread::spawn(move || {
                engine.apply(
                    &LevelUpdate::new(&instrument)
                        .with_nonces(0, 0)
                        .bid(dec!(100), dec!(1))
                        .ask(dec!(101), dec!(1)),
                );
                for nonce in 1..=200u64 {
                    let size = Decimal::from(nonce);
                    let update = LevelUpdate::new(&instrument)
                        .with_nonces(nonce - 1, nonce)
                        .bid(dec!(100), size)
                        .ask(dec!(101), size);
                    assert_eq!(engine.apply(&update), Classification::Delta);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for instrument in instruments {
        let book = engine.book(instrument).unwrap();
        assert_eq!(book.nonce(), Some(200));
        assert_eq!(book.best_bid().size, dec!(200));
        assert_eq!(book.best_ask().size, dec!(200));
    }
    assert_eq!(engine.metrics().updates(Classification::Delta), 800);
    engine.shutdown();
}

#[test]
fn test_readers_never_see_torn_books() {
    let engine = Arc::new(engine_with_btc(dec!(1)));
    engine.apply(
        &LevelUpdate::new("BTC-X")
            .with_nonces(0, 0)
            .bid(dec!(100), dec!(1))
            .ask(dec!(101), dec!(1)),
    );

    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            let done = done.clone();
            let reads = reads.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let book = engine.book("BTC-X").unwrap();
                    // Every update moves both sides together, so the sizes must match
                    assert_eq!(book.best_bid().size, book.best_ask().size);
                    assert!(book.best_bid().price <= book.midpoint());
                    assert!(book.midpoint() <= book.best_ask().price);
                    let imbalance = book.weighted_imbalance(0.5);
                    assert!((-100.0..=100.0).contains(&imbalance));
                    let _ = book.depth_vwap_midpoint(&DepthVwapParams::default());
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for nonce in 1..=2_000u64 {
        let size = Decimal::from(nonce % 17 + 1);
        engine.apply(
            &LevelUpdate::new("BTC-X")
                .with_nonces(nonce - 1, nonce)
                .bid(dec!(100), size)
                .ask(dec!(101), size),
        );
    }

    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert!(reads.load(Ordering::Relaxed) > 0);
    engine.shutdown();
}

#[test]
fn test_malformed_rows_are_dropped_not_fatal() {
    let engine = engine_with_btc(dec!(1));
    let raw = r#"{
        "instrument": "BTC-X",
        "begin_nonce": 0,
        "nonce": 1,
        "bids": [{"price": "100", "size": "NaN"}, {"price": "99", "size": "2"}],
        "asks": [{"price": "101"}, {"price": "-5", "size": "1"}, {"price": "102", "size": 3}]
    }"#;
    let update = LevelUpdate::from_json(raw).unwrap();
    assert_eq!(engine.apply(&update), Classification::Snapshot);

    let book = engine.book("BTC-X").unwrap();
    assert_eq!(book.best_bid().price, dec!(99));
    assert_eq!(book.best_ask().price, dec!(102));
    assert_eq!(engine.metrics().malformed_levels(), 3);
    engine.shutdown();
}

#[test]
fn test_listener_callbacks_follow_publish_order() {
    let engine = engine_with_btc(dec!(1));
    let mut seq = Sequence::new();

    let mut listener = MockListener::new();
    listener
        .expect_on_best_bid_changed()
        .withf(|_, price, _, _| *price == dec!(100))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _, _| {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        });
    listener
        .expect_on_best_bid_changed()
        .withf(|_, price, _, _| *price == dec!(101))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _, _| Ok(()));
    listener.expect_on_best_ask_changed().never();
    listener.expect_on_book_snapshot().times(2).returning(|_, _| Ok(()));
    engine.subscribe(Arc::new(listener));

    engine.apply(&LevelUpdate::new("BTC-X").with_nonces(0, 1).bid(dec!(100), dec!(1)));
    engine.apply(
        &LevelUpdate::new("BTC-X")
            .with_nonces(1, 2)
            .bid(dec!(100), dec!(0))
            .bid(dec!(101), dec!(1)),
    );
    engine.shutdown();

    // An out-of-order call panics inside the isolated dispatch
    assert_eq!(engine.metrics().listener_failures(), 0);
    assert_eq!(engine.book("BTC-X").unwrap().best_bid().price, dec!(101));
}

fn snapshot_counter(engine: &OrderBookEngine) -> Arc<AtomicUsize> {
    let snapshots = Arc::new(AtomicUsize::new(0));
    let seen = snapshots.clone();
    let mut listener = MockListener::new();
    listener.expect_on_best_bid_changed().returning(|_, _, _, _| Ok(()));
    listener.expect_on_best_ask_changed().returning(|_, _, _, _| Ok(()));
    listener.expect_on_book_snapshot().returning(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    engine.subscribe(Arc::new(listener));
    snapshots
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_from_async_service() {
    let engine = engine_with_btc(dec!(1));
    let snapshots = snapshot_counter(&engine);

    engine.apply(
        &LevelUpdate::new("BTC-X")
            .with_nonces(0, 1)
            .bid(dec!(100), dec!(1))
            .ask(dec!(101), dec!(1)),
    );
    engine.shutdown();

    assert_eq!(snapshots.load(Ordering::SeqCst), 1);
    assert!(engine.is_initialized("BTC-X"));
}

#[tokio::test]
async fn test_shutdown_from_current_thread_runtime() {
    let engine = engine_with_btc(dec!(1));
    let snapshots = snapshot_counter(&engine);

    engine.apply(&LevelUpdate::new("BTC-X").with_nonces(0, 1).bid(dec!(100), dec!(1)));
    engine.shutdown();
    engine.shutdown();

    assert_eq!(snapshots.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fine_ticks_never_panic_the_writer() {
    assert!(TickSize::new(Decimal::new(1, 27)).is_err());

    let engine = OrderBookEngine::new(EngineConfig::default()).unwrap();
    let finest = TickSize::new(dec!(0.000000000001)).unwrap();
    engine.register_instrument("FINE", finest).unwrap();

    let update = LevelUpdate::new("FINE")
        .with_nonces(0, 1)
        .bid(dec!(100), dec!(1))
        .bid(dec!(100000000000000000000), dec!(1))
        .ask(dec!(100.5), dec!(1));
    assert_eq!(engine.apply(&update), Classification::Snapshot);

    let book = engine.book("FINE").unwrap();
    assert_eq!(book.best_bid().price, dec!(100));
    assert_eq!(book.best_ask().price, dec!(100.5));
    assert_eq!(book.midpoint(), dec!(100.25));
    assert_eq!(engine.metrics().malformed_levels(), 1);
    engine.shutdown();
}
