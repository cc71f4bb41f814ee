//! End-to-end intent handling against the paper exchange

use chrono::Utc;
use ordex::config::{AppConfig, BudgetConfig, TransitionStrategyKind};
use ordex::domain::{EventKind, FailReason, Intent, LifecycleEvent, OrderPhase, Side};
use ordex::execution::{BudgetLedger, ExecutionOutcome, FsmEngine, IdempotencyStore, OrderRouter};
use ordex::persistence::{AuditEntry, AuditLog, MemoryAuditLog, MemorySnapshotStore, SnapshotStore};
use ordex::{ExchangeError, EventBus, PaperExchange, PaperStep, StaticPriceOracle};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Stack {
    ledger: Arc<BudgetLedger>,
    engine: Arc<FsmEngine>,
    snapshots: Arc<MemorySnapshotStore>,
    audit: Arc<MemoryAuditLog>,
    exchange: Arc<PaperExchange>,
    router: Arc<OrderRouter>,
    bus: EventBus,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default_config();
    config.budget = BudgetConfig {
        initial_capital: dec!(1000),
        reserve_buffer: Decimal::ZERO,
        ..BudgetConfig::default()
    };
    config.timeouts.fill_timeout_ms = 1_000;
    config
}

fn stack(config: AppConfig, exchange: PaperExchange) -> Stack {
    let oracle = StaticPriceOracle::new()
        .with_price("BTC/USDT", dec!(100))
        .with_price("ETH/USDT", dec!(100));
    for i in 0..8 {
        oracle.set(format!("SYM{}/USDT", i), dec!(100));
    }
    stack_with_oracle(config, exchange, oracle)
}

fn stack_with_oracle(config: AppConfig, exchange: PaperExchange, oracle: StaticPriceOracle) -> Stack {
    let ledger = Arc::new(BudgetLedger::new(&config.budget));
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let engine = Arc::new(FsmEngine::new(
        &config,
        ledger.clone(),
        Arc::new(IdempotencyStore::new(&config.idempotency)),
        snapshots.clone(),
        audit.clone(),
    ));
    let exchange = Arc::new(exchange);
    let bus = EventBus::default();
    let router = Arc::new(
        OrderRouter::new(&config, engine.clone(), ledger.clone(), exchange.clone(), Arc::new(oracle))
            .with_event_bus(bus.clone()),
    );
    Stack {
        ledger,
        engine,
        snapshots,
        audit,
        exchange,
        router,
        bus,
    }
}

fn buy(symbol: &str, qty: Decimal, tag: &str) -> Intent {
    Intent::new(symbol, Side::Buy, qty, dec!(100), Utc::now(), tag.as_bytes())
}

#[tokio::test]
async fn happy_path_fills_and_commits() {
    let s = stack(config(), PaperExchange::new());
    let mut events = s.bus.subscribe();
    let intent = buy("BTC/USDT", dec!(1), "happy");

    let outcome = s.router.handle_intent(intent.clone()).await;

    assert_eq!(
        outcome,
        ExecutionOutcome::Filled {
            intent_id: intent.intent_id.clone(),
            filled_qty: dec!(1),
            avg_price: dec!(100),
            fees: Decimal::ZERO,
        }
    );
    assert_eq!(s.ledger.available(), dec!(900));
    assert!(s.snapshots.is_empty());

    let state = s.engine.state(&intent.key()).await.unwrap();
    assert_eq!(state.phase, OrderPhase::Filled);
    assert!(state.reservation.unwrap().is_balanced());

    match events.recv().await.unwrap() {
        LifecycleEvent::Filled { intent_id, filled_qty, .. } => {
            assert_eq!(intent_id, intent.intent_id);
            assert_eq!(filled_qty, dec!(1));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let trail = s.audit.by_intent(&intent.intent_id).await.unwrap();
    let transitions = trail.iter().filter(|r| r.kind() == "transition").count();
    assert_eq!(transitions, 3);
}

#[tokio::test]
async fn fill_above_limit_with_fees_commits_actual_cost() {
    let mut config = config();
    config.budget.reserve_buffer = dec!(0.01);
    let exchange = PaperExchange::new()
        .with_fee_rate(dec!(0.001))
        .with_script([PaperStep::FillAt(dec!(50005))]);
    let oracle = StaticPriceOracle::new().with_price("BTC/USDT", dec!(50000));
    let s = stack_with_oracle(config, exchange, oracle);
    let mut events = s.bus.subscribe();
    let intent = Intent::new("BTC/USDT", Side::Buy, dec!(0.01), dec!(50000), Utc::now(), b"btc");

    let outcome = s.router.handle_intent(intent.clone()).await;

    // 0.01 * 50005 = 500.05 plus 0.1% fee
    assert_eq!(
        outcome,
        ExecutionOutcome::Filled {
            intent_id: intent.intent_id.clone(),
            filled_qty: dec!(0.01),
            avg_price: dec!(50005),
            fees: dec!(0.50005),
        }
    );
    assert_eq!(s.exchange.placed()[0].limit_price, dec!(50000));

    let state = s.engine.state(&intent.key()).await.unwrap();
    let reservation = state.reservation.unwrap();
    // 505 held with the 1% buffer; the unspent 4.44995 went back
    assert_eq!(reservation.reserved_notional, dec!(505));
    assert_eq!(reservation.committed_notional, dec!(500.55005));
    assert_eq!(reservation.released_notional, dec!(4.44995));
    assert!(reservation.is_balanced());

    let snapshot = s.ledger.snapshot().unwrap();
    assert_eq!(snapshot.committed_total, dec!(500.55005));
    assert_eq!(snapshot.available, dec!(499.44995));
    assert_eq!(snapshot.open_reservations, 0);
    assert_eq!(events.recv().await.unwrap().topic(), "order.filled");
}

#[tokio::test(start_paused = true)]
async fn failed_cancel_still_times_out_and_retries() {
    let s = stack(config(), PaperExchange::new().with_script([PaperStep::Rest]));
    s.exchange
        .fail_cancels(ExchangeError::Transient("cancel endpoint unavailable".into()));
    let intent = buy("BTC/USDT", dec!(1), "cancel-fails");

    let outcome = s.router.handle_intent(intent.clone()).await;

    assert!(outcome.is_filled(), "{}", outcome);
    assert_eq!(s.exchange.placed().len(), 2);
    assert_eq!(s.ledger.available(), dec!(900));

    let timeout_id = format!("timeout:{}", intent.client_order_id(1));
    let trail = s.audit.by_intent(&intent.intent_id).await.unwrap();
    assert!(trail.iter().any(|r| matches!(
        &r.entry,
        AuditEntry::Transition {
            from: OrderPhase::Sent,
            to: OrderPhase::Retry,
            event: EventKind::Timeout,
            event_id,
        } if *event_id == timeout_id
    )));

    let state = s.engine.state(&intent.key()).await.unwrap();
    assert_eq!(state.phase, OrderPhase::Filled);
    assert_eq!(state.retry_count, 1);
}

#[tokio::test]
async fn reservation_failure_leaves_no_state() {
    let s = stack(config(), PaperExchange::new());
    let intent = buy("BTC/USDT", dec!(20), "too-big");

    let outcome = s.router.handle_intent(intent.clone()).await;

    assert_eq!(outcome.fail_reason(), Some(FailReason::ReserveFailed));
    assert_eq!(s.ledger.available(), dec!(1000));
    assert!(s.exchange.placed().is_empty());
    let phase = s.engine.state(&intent.key()).await.map(|st| st.phase);
    assert!(matches!(phase, None | Some(OrderPhase::New)));
    assert!(s.snapshots.is_empty());
}

#[tokio::test]
async fn duplicate_intent_is_a_no_op() {
    let s = stack(config(), PaperExchange::new());
    let intent = buy("BTC/USDT", dec!(1), "dup");

    let first = s.router.submit(intent.clone());
    let second = s.router.submit(intent.clone());
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_filled()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, ExecutionOutcome::Duplicate { .. }))
            .count(),
        1
    );
    assert_eq!(s.exchange.placed().len(), 1);
    assert_eq!(s.ledger.available(), dec!(900));
}

#[tokio::test(start_paused = true)]
async fn partial_fill_then_exhausted_commits_filled_part() {
    let exchange = PaperExchange::new().with_script([
        PaperStep::FillPartial {
            qty: dec!(0.6),
            price: dec!(100),
        },
        PaperStep::Rest,
        PaperStep::Rest,
    ]);
    let s = stack(config(), exchange);
    let mut events = s.bus.subscribe();
    let intent = buy("BTC/USDT", dec!(1), "partial");

    let started = tokio::time::Instant::now();
    let outcome = s.router.handle_intent(intent.clone()).await;

    assert_eq!(
        outcome,
        ExecutionOutcome::Partial {
            intent_id: intent.intent_id.clone(),
            filled_qty: dec!(0.6),
            remaining_qty: dec!(0.4),
        }
    );
    // Three fill timeouts plus 400/800/1600 ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(5_800));

    let placed = s.exchange.placed();
    assert_eq!(placed.len(), 3);
    assert_eq!(placed[1].quantity, dec!(0.4));
    assert_ne!(placed[0].client_order_id, placed[1].client_order_id);

    let state = s.engine.state(&intent.key()).await.unwrap();
    assert_eq!(state.phase, OrderPhase::FailedFinal);
    let reservation = state.reservation.unwrap();
    assert_eq!(reservation.committed_notional, dec!(60));
    assert_eq!(reservation.released_notional, dec!(40));
    assert_eq!(s.ledger.available(), dec!(940));

    assert_eq!(events.recv().await.unwrap().topic(), "order.partial");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_bounded() {
    let transient = PaperStep::Fail(ExchangeError::Transient("502 bad gateway".into()));
    let exchange = PaperExchange::new().with_script([transient.clone(), transient.clone(), transient]);
    let s = stack(config(), exchange);
    let intent = buy("BTC/USDT", dec!(1), "bounded");

    let started = tokio::time::Instant::now();
    let outcome = s.router.handle_intent(intent.clone()).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.fail_reason(), Some(FailReason::RetriesExhausted));
    assert!(elapsed >= Duration::from_millis(2_800), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_900), "{:?}", elapsed);

    let ids: Vec<String> = s
        .exchange
        .placed()
        .into_iter()
        .map(|r| r.client_order_id)
        .collect();
    assert_eq!(
        ids,
        vec![
            intent.client_order_id(1),
            intent.client_order_id(2),
            intent.client_order_id(3)
        ]
    );
    assert_eq!(
        s.engine.state(&intent.key()).await.unwrap().phase,
        OrderPhase::FailedFinal
    );
    assert_eq!(s.ledger.available(), dec!(1000));
}

#[tokio::test(start_paused = true)]
async fn legacy_strategy_cancels_without_retry() {
    let mut config = config();
    config.execution.transition_strategy = TransitionStrategyKind::Legacy;
    let s = stack(config, PaperExchange::new().with_script([PaperStep::Rest]));
    let intent = buy("ETH/USDT", dec!(2), "legacy");

    let outcome = s.router.handle_intent(intent.clone()).await;

    assert_eq!(outcome.fail_reason(), Some(FailReason::Canceled));
    assert_eq!(s.exchange.placed().len(), 1);
    assert_eq!(
        s.engine.state(&intent.key()).await.unwrap().phase,
        OrderPhase::Canceled
    );
    assert_eq!(s.ledger.available(), dec!(1000));
}

#[tokio::test(start_paused = true)]
async fn busy_key_rejects_second_intent() {
    let s = stack(
        config(),
        PaperExchange::new().with_script([PaperStep::Rest, PaperStep::Rest, PaperStep::Rest]),
    );
    let first = s.router.submit(buy("BTC/USDT", dec!(1), "first"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = s.router.handle_intent(buy("BTC/USDT", dec!(1), "second")).await;
    assert_eq!(outcome.fail_reason(), Some(FailReason::KeyBusy));

    let first = first.await.unwrap();
    assert_eq!(first.fail_reason(), Some(FailReason::RetriesExhausted));
    assert_eq!(s.ledger.available(), dec!(1000));
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_leak_no_budget() {
    let exchange = PaperExchange::new().with_script([
        PaperStep::Fill,
        PaperStep::Fail(ExchangeError::Permanent("post-only would cross".into())),
        PaperStep::FillPartial {
            qty: dec!(0.5),
            price: dec!(100),
        },
        PaperStep::Fail(ExchangeError::Transient("timeout".into())),
        PaperStep::FillAt(dec!(99)),
        PaperStep::Rest,
        PaperStep::Fill,
        PaperStep::Rest,
    ]);
    let s = stack(config(), exchange);

    let handles: Vec<_> = (0..8)
        .map(|i| s.router.submit(buy(&format!("SYM{}/USDT", i), dec!(1), "mixed")))
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(!matches!(outcome, ExecutionOutcome::Duplicate { .. }));
    }

    let snapshot = s.ledger.snapshot().unwrap();
    assert_eq!(snapshot.reserved_outstanding, Decimal::ZERO);
    assert_eq!(snapshot.available + snapshot.committed_total, dec!(1000));

    for key in s.engine.keys() {
        let state = s.engine.state(&key).await.unwrap();
        assert!(state.phase.is_terminal(), "{} is {}", key, state.phase);
        assert!(state.reservation.unwrap().is_balanced());
    }
    // Only terminal states that still carry recovery value keep a snapshot
    for state in s.snapshots.list().await.unwrap() {
        assert_ne!(state.phase, OrderPhase::Filled);
    }
}
