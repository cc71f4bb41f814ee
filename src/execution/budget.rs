//! Budget ledger for capital reservation
//!
//! Sole source of truth for "is this capital already spoken for":
//! - Atomic reserve / commit / release per intent
//! - Surplus from cheaper-than-reserved fills returned in the commit step
//! - Per-symbol exposure caps
//! - Equity watermark for drawdown tracking
//!
//! Lock order: the ledger mutex is always the innermost lock. It is a plain
//! `std::sync::Mutex`, never held across an `.await`, and no I/O happens
//! while it is held.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{BudgetConfig, PeakRebasePolicy, SurplusReleasePolicy};
use crate::domain::{BudgetReservation, ReservationHandle, Side};
use crate::error::{OrdexError, Result};

/// Settled reservations kept so late `release` calls stay idempotent
const SETTLED_RETENTION: usize = 4096;

/// Budget ledger shared by every intent
pub struct BudgetLedger {
    inner: Mutex<LedgerInner>,
    reserve_buffer: Decimal,
    max_symbol_notional: Option<Decimal>,
    surplus_release: SurplusReleasePolicy,
    peak_rebase: PeakRebasePolicy,
}

struct LedgerInner {
    available: Decimal,
    /// Open reservations only
    reservations: HashMap<ReservationHandle, BudgetReservation>,
    settled: HashMap<ReservationHandle, BudgetReservation>,
    settled_order: VecDeque<ReservationHandle>,
    committed_total: Decimal,
    released_total: Decimal,
    session_peak: Decimal,
    rolling_peak: Option<Decimal>,
    peak: Decimal,
}

impl LedgerInner {
    fn outstanding(&self) -> Decimal {
        self.reservations.values().map(|r| r.outstanding()).sum()
    }

    fn equity(&self) -> Decimal {
        self.available + self.outstanding()
    }

    /// Capital still held for the symbol; settled reservations no longer count
    fn symbol_exposure(&self, symbol: &str) -> Decimal {
        self.reservations
            .values()
            .filter(|r| r.symbol == symbol)
            .map(|r| r.outstanding())
            .sum()
    }

    fn settle(&mut self, reservation: BudgetReservation) {
        let handle = reservation.handle;
        self.reservations.remove(&handle);
        if self.settled.insert(handle, reservation).is_none() {
            self.settled_order.push_back(handle);
        }
        while self.settled_order.len() > SETTLED_RETENTION {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    fn find(&self, handle: &ReservationHandle) -> Option<&BudgetReservation> {
        self.reservations
            .get(handle)
            .or_else(|| self.settled.get(handle))
    }

    fn mark_equity(&mut self) {
        let equity = self.equity();
        if equity > self.session_peak {
            self.session_peak = equity;
        }
        if equity > self.peak {
            self.peak = equity;
        }
    }
}

/// Point-in-time ledger summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub available: Decimal,
    pub reserved_outstanding: Decimal,
    pub committed_total: Decimal,
    pub released_total: Decimal,
    pub open_reservations: usize,
    pub session_peak: Decimal,
    pub peak: Decimal,
}

impl std::fmt::Display for LedgerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Available: {:.2} | Reserved: {:.2} ({} open) | Committed: {:.2} | Released: {:.2} | Peak: {:.2}",
            self.available,
            self.reserved_outstanding,
            self.open_reservations,
            self.committed_total,
            self.released_total,
            self.peak
        )
    }
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        let capital = config.initial_capital;
        Self {
            inner: Mutex::new(LedgerInner {
                available: capital,
                reservations: HashMap::new(),
                settled: HashMap::new(),
                settled_order: VecDeque::new(),
                committed_total: Decimal::ZERO,
                released_total: Decimal::ZERO,
                session_peak: capital,
                rolling_peak: config.rolling_peak,
                peak: capital,
            }),
            reserve_buffer: config.reserve_buffer,
            max_symbol_notional: config.max_symbol_notional,
            surplus_release: config.surplus_release,
            peak_rebase: config.peak_rebase,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerInner>> {
        self.inner.lock().map_err(|_| {
            error!("Budget ledger lock poisoned; refusing further accounting");
            OrdexError::BudgetAccounting("ledger lock poisoned".to_string())
        })
    }

    /// Notional held for `qty` at `price`, including the reserve buffer
    pub fn required_notional(&self, qty: Decimal, price: Decimal) -> Decimal {
        qty * price * (Decimal::ONE + self.reserve_buffer)
    }

    /// Atomically check and hold capital for an intent. No side effects on failure.
    pub fn reserve(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        intent_id: &str,
    ) -> Result<BudgetReservation> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(OrdexError::Validation(format!(
                "reserve requires positive qty and price, got {} @ {}",
                qty, price
            )));
        }

        let notional = self.required_notional(qty, price);
        let mut inner = self.lock()?;

        if notional > inner.available {
            return Err(OrdexError::InsufficientBudget {
                symbol: symbol.to_string(),
                requested: notional,
                available: inner.available,
            });
        }

        if let Some(cap) = self.max_symbol_notional {
            let exposure = inner.symbol_exposure(symbol);
            if exposure + notional > cap {
                return Err(OrdexError::InsufficientBudget {
                    symbol: symbol.to_string(),
                    requested: notional,
                    available: (cap - exposure).max(Decimal::ZERO),
                });
            }
        }

        let reservation = BudgetReservation {
            handle: ReservationHandle::new(),
            symbol: symbol.to_string(),
            side,
            intent_id: intent_id.to_string(),
            reserved_qty: qty,
            reserved_price: price,
            reserved_notional: notional,
            committed_qty: Decimal::ZERO,
            committed_notional: Decimal::ZERO,
            released_notional: Decimal::ZERO,
            held_surplus: Decimal::ZERO,
            settled: false,
            created_at: Utc::now(),
        };

        inner.available -= notional;
        inner
            .reservations
            .insert(reservation.handle, reservation.clone());

        debug!(
            intent_id,
            symbol,
            %notional,
            available = %inner.available,
            "Budget reserved"
        );

        Ok(reservation)
    }

    /// Convert part of a reservation into realized spend.
    ///
    /// The slice of the reservation backing `qty` is consumed; whatever the fill
    /// did not spend is released in the same step (or held until settlement under
    /// the on-terminal policy). A fill costing more than its slice draws the
    /// overage from available capital and tops the reservation up, so
    /// `committed + released == reserved` keeps holding. An overage that
    /// available capital cannot cover is refused and nothing changes.
    pub fn commit(
        &self,
        handle: &ReservationHandle,
        qty: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Result<BudgetReservation> {
        let mut inner = self.lock()?;

        let mut reservation = inner.find(handle).cloned().ok_or_else(|| {
            error!(%handle, "Commit against unknown reservation");
            OrdexError::BudgetAccounting(format!("unknown reservation {}", handle))
        })?;

        if reservation.settled {
            error!(%handle, intent_id = %reservation.intent_id, "Commit against settled reservation");
            return Err(OrdexError::BudgetAccounting(format!(
                "reservation {} already settled",
                handle
            )));
        }

        let uncommitted = reservation.uncommitted_qty();
        if qty <= Decimal::ZERO || qty > uncommitted {
            error!(%handle, %qty, %uncommitted, "Commit quantity out of range");
            return Err(OrdexError::BudgetAccounting(format!(
                "commit of {} against {} uncommitted on {}",
                qty, uncommitted, handle
            )));
        }

        let allocated = reservation.outstanding() - reservation.held_surplus;
        let slice = if qty == uncommitted {
            allocated
        } else {
            allocated * qty / uncommitted
        };
        let spend = qty * price + fee;

        if spend <= slice {
            let surplus = slice - spend;
            match self.surplus_release {
                SurplusReleasePolicy::PerFill => {
                    reservation.released_notional += surplus;
                    inner.available += surplus;
                    inner.released_total += surplus;
                }
                SurplusReleasePolicy::OnTerminal => {
                    reservation.held_surplus += surplus;
                }
            }
        } else {
            let overage = spend - slice;
            if overage > inner.available {
                error!(
                    intent_id = %reservation.intent_id,
                    %overage,
                    available = %inner.available,
                    "Fill overage exceeds available capital"
                );
                return Err(OrdexError::BudgetAccounting(format!(
                    "fill overage {} on {} exceeds available {}",
                    overage, handle, inner.available
                )));
            }
            reservation.reserved_notional += overage;
            inner.available -= overage;
            warn!(
                intent_id = %reservation.intent_id,
                %overage,
                "Fill cost exceeded reserved slice; topped up reservation"
            );
        }

        reservation.committed_notional += spend;
        reservation.committed_qty += qty;
        inner.committed_total += spend;
        inner
            .reservations
            .insert(reservation.handle, reservation.clone());

        debug!(
            intent_id = %reservation.intent_id,
            %qty,
            %price,
            %fee,
            committed = %reservation.committed_notional,
            "Budget committed"
        );

        Ok(reservation)
    }

    /// Release everything still outstanding and settle the reservation.
    /// Releasing an already settled reservation is a no-op while it is retained.
    pub fn release(&self, handle: &ReservationHandle) -> Result<BudgetReservation> {
        let mut inner = self.lock()?;

        let mut reservation = inner.find(handle).cloned().ok_or_else(|| {
            error!(%handle, "Release of unknown reservation");
            OrdexError::BudgetAccounting(format!("unknown reservation {}", handle))
        })?;

        if reservation.settled {
            return Ok(reservation);
        }

        let outstanding = reservation.outstanding();
        reservation.released_notional += outstanding;
        reservation.held_surplus = Decimal::ZERO;
        reservation.settled = true;
        inner.available += outstanding;
        inner.released_total += outstanding;
        inner.settle(reservation.clone());

        if !reservation.is_balanced() {
            error!(
                intent_id = %reservation.intent_id,
                reserved = %reservation.reserved_notional,
                committed = %reservation.committed_notional,
                released = %reservation.released_notional,
                "Reservation unbalanced after settlement"
            );
            return Err(OrdexError::BudgetAccounting(format!(
                "reservation {} unbalanced after settlement",
                handle
            )));
        }

        debug!(
            intent_id = %reservation.intent_id,
            released = %outstanding,
            available = %inner.available,
            "Budget released"
        );

        Ok(reservation)
    }

    /// Re-register a reservation recovered from a snapshot
    pub fn restore(&self, reservation: &BudgetReservation) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.find(&reservation.handle).is_some() {
            return Ok(());
        }

        if reservation.settled {
            inner.settle(reservation.clone());
            return Ok(());
        }

        let outstanding = reservation.outstanding();
        inner.available -= outstanding;
        if inner.available < Decimal::ZERO {
            warn!(
                intent_id = %reservation.intent_id,
                %outstanding,
                "Restored reservation exceeds available capital"
            );
        }

        inner
            .reservations
            .insert(reservation.handle, reservation.clone());
        info!(
            intent_id = %reservation.intent_id,
            outstanding = %reservation.outstanding(),
            "Restored reservation"
        );
        Ok(())
    }

    /// Add tradable capital (e.g. sale proceeds handed back by position management)
    pub fn deposit(&self, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(OrdexError::Validation(format!(
                "deposit must be positive, got {}",
                amount
            )));
        }
        let mut inner = self.lock()?;
        inner.available += amount;
        inner.mark_equity();
        Ok(())
    }

    pub fn reservation(&self, handle: &ReservationHandle) -> Option<BudgetReservation> {
        self.lock()
            .ok()
            .and_then(|inner| inner.find(handle).cloned())
    }

    pub fn available(&self) -> Decimal {
        self.lock().map(|inner| inner.available).unwrap_or(Decimal::ZERO)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        let inner = self.lock()?;
        Ok(LedgerSnapshot {
            available: inner.available,
            reserved_outstanding: inner.outstanding(),
            committed_total: inner.committed_total,
            released_total: inner.released_total,
            open_reservations: inner.reservations.len(),
            session_peak: inner.session_peak,
            peak: inner.peak,
        })
    }

    /// Fraction of the watermark lost, 0 when at or above the peak
    pub fn drawdown(&self) -> Result<Decimal> {
        let inner = self.lock()?;
        if inner.peak <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        Ok(((inner.peak - inner.equity()) / inner.peak).max(Decimal::ZERO))
    }

    /// Rebase the watermark after a stale-state reset, using the configured policy
    pub fn rebase_peak(&self) -> Result<Decimal> {
        self.rebase_peak_with(self.peak_rebase)
    }

    pub fn rebase_peak_with(&self, policy: PeakRebasePolicy) -> Result<Decimal> {
        let mut inner = self.lock()?;
        let base = match policy {
            PeakRebasePolicy::SessionPeak => inner.session_peak,
            PeakRebasePolicy::MaxOfSessionAndRolling => match inner.rolling_peak {
                Some(rolling) => inner.session_peak.max(rolling),
                None => inner.session_peak,
            },
        };
        inner.peak = base;
        info!(?policy, peak = %base, "Rebased capital watermark");
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger(capital: Decimal, buffer: Decimal) -> BudgetLedger {
        BudgetLedger::new(&BudgetConfig {
            initial_capital: capital,
            reserve_buffer: buffer,
            ..BudgetConfig::default()
        })
    }

    #[test]
    fn test_reserve_decrements_available() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(0.01), dec!(50000), "i-1")
            .unwrap();
        assert_eq!(res.reserved_notional, dec!(500));
        assert_eq!(ledger.available(), dec!(500));
    }

    #[test]
    fn test_reserve_failure_has_no_side_effects() {
        let ledger = ledger(dec!(100), Decimal::ZERO);
        let err = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(500), "i-1")
            .unwrap_err();
        assert!(matches!(err, OrdexError::InsufficientBudget { .. }));
        assert_eq!(ledger.available(), dec!(100));
        assert_eq!(ledger.snapshot().unwrap().open_reservations, 0);
    }

    #[test]
    fn test_symbol_cap() {
        let ledger = BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            max_symbol_notional: Some(dec!(150)),
            ..BudgetConfig::default()
        });
        ledger
            .reserve("ETH/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();
        let err = ledger
            .reserve("ETH/USDT", Side::Buy, dec!(1), dec!(100), "i-2")
            .unwrap_err();
        assert!(matches!(err, OrdexError::InsufficientBudget { .. }));
        // Other symbols are unaffected
        assert!(ledger
            .reserve("SOL/USDT", Side::Buy, dec!(1), dec!(100), "i-3")
            .is_ok());
    }

    #[test]
    fn test_symbol_cap_counts_open_reservations_only() {
        let ledger = BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            max_symbol_notional: Some(dec!(150)),
            ..BudgetConfig::default()
        });
        let buy = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();
        ledger.commit(&buy.handle, dec!(1), dec!(100), Decimal::ZERO).unwrap();
        ledger.release(&buy.handle).unwrap();
        assert_eq!(ledger.snapshot().unwrap().open_reservations, 0);

        // The settled buy no longer counts against the cap
        let sell = ledger
            .reserve("BTC/USDT", Side::Sell, dec!(1), dec!(100), "i-2")
            .unwrap();
        assert_eq!(ledger.snapshot().unwrap().open_reservations, 1);

        // Still retained for idempotent release
        let again = ledger.release(&buy.handle).unwrap();
        assert!(again.settled);
        assert_eq!(ledger.reservation(&buy.handle), Some(again));
        ledger.release(&sell.handle).unwrap();
        assert_eq!(ledger.available(), dec!(900));
    }

    #[test]
    fn test_settled_reservations_are_bounded() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let first = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(1), "i-0")
            .unwrap();
        ledger.release(&first.handle).unwrap();
        for i in 1..=SETTLED_RETENTION {
            let res = ledger
                .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(1), &format!("i-{}", i))
                .unwrap();
            ledger.release(&res.handle).unwrap();
        }

        let inner = ledger.lock().unwrap();
        assert_eq!(inner.settled.len(), SETTLED_RETENTION);
        assert!(inner.reservations.is_empty());
        drop(inner);
        assert!(ledger.reservation(&first.handle).is_none());
        assert_eq!(ledger.available(), dec!(1000));
    }

    #[test]
    fn test_uncovered_overage_is_refused() {
        let ledger = ledger(dec!(95), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Sell, dec!(1), dec!(90), "i-1")
            .unwrap();
        assert_eq!(ledger.available(), dec!(5));

        // 99.5 against a 90 slice needs 9.5 more than the 5 left
        let err = ledger
            .commit(&res.handle, dec!(1), dec!(99.5), Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, OrdexError::BudgetAccounting(_)));
        assert_eq!(ledger.available(), dec!(5));
        assert_eq!(ledger.reservation(&res.handle), Some(res.clone()));

        // A covered overage still goes through
        let after = ledger
            .commit(&res.handle, dec!(1), dec!(94), Decimal::ZERO)
            .unwrap();
        assert_eq!(after.reserved_notional, dec!(94));
        assert_eq!(ledger.available(), dec!(1));
    }

    #[test]
    fn test_partial_commit_releases_surplus_in_same_step() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();

        // Fill 0.4 at 90: slice is 40, spend 36, surplus 4 goes back immediately
        let after = ledger.commit(&res.handle, dec!(0.4), dec!(90), Decimal::ZERO).unwrap();
        assert_eq!(after.committed_notional, dec!(36));
        assert_eq!(after.released_notional, dec!(4));
        assert_eq!(after.outstanding(), dec!(60));
        assert_eq!(ledger.available(), dec!(904));
    }

    #[test]
    fn test_on_terminal_policy_holds_surplus() {
        let ledger = BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            surplus_release: SurplusReleasePolicy::OnTerminal,
            ..BudgetConfig::default()
        });
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();
        let after = ledger.commit(&res.handle, dec!(0.5), dec!(90), Decimal::ZERO).unwrap();
        assert_eq!(after.held_surplus, dec!(5));
        assert_eq!(after.released_notional, Decimal::ZERO);
        assert_eq!(ledger.available(), dec!(900));

        // Next slice is computed without the held surplus
        let after = ledger.commit(&res.handle, dec!(0.5), dec!(100), Decimal::ZERO).unwrap();
        assert_eq!(after.committed_notional, dec!(95));

        let settled = ledger.release(&res.handle).unwrap();
        assert!(settled.is_balanced());
        assert_eq!(settled.released_notional, dec!(5));
        assert_eq!(ledger.available(), dec!(905));
    }

    #[test]
    fn test_overage_tops_up_reservation() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(0.01), dec!(50000), "i-1")
            .unwrap();
        let after = ledger
            .commit(&res.handle, dec!(0.01), dec!(50005), dec!(0.5))
            .unwrap();
        assert_eq!(after.committed_notional, dec!(500.55));
        assert_eq!(after.reserved_notional, dec!(500.55));
        let settled = ledger.release(&res.handle).unwrap();
        assert!(settled.is_balanced());
        assert_eq!(ledger.available(), dec!(499.45));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();
        let first = ledger.release(&res.handle).unwrap();
        let second = ledger.release(&res.handle).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.available(), dec!(1000));
        assert_eq!(ledger.snapshot().unwrap().released_total, dec!(100));
    }

    #[test]
    fn test_commit_errors_are_loud_not_silent() {
        let ledger = ledger(dec!(1000), Decimal::ZERO);
        let res = ledger
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();

        let over = ledger.commit(&res.handle, dec!(2), dec!(100), Decimal::ZERO);
        assert!(matches!(over, Err(OrdexError::BudgetAccounting(_))));

        ledger.release(&res.handle).unwrap();
        let after_settle = ledger.commit(&res.handle, dec!(0.1), dec!(100), Decimal::ZERO);
        assert!(matches!(after_settle, Err(OrdexError::BudgetAccounting(_))));

        let unknown = ledger.release(&ReservationHandle::new());
        assert!(matches!(unknown, Err(OrdexError::BudgetAccounting(_))));
    }

    #[test]
    fn test_no_leak_across_mixed_sequences() {
        let ledger = ledger(dec!(10000), dec!(0.01));
        let fills: [&[(Decimal, Decimal)]; 4] = [
            &[],
            &[(dec!(0.3), dec!(99))],
            &[(dec!(0.5), dec!(100)), (dec!(0.5), dec!(101))],
            &[(dec!(0.2), dec!(98)), (dec!(0.2), dec!(102)), (dec!(0.2), dec!(100))],
        ];

        for (i, sequence) in fills.iter().enumerate() {
            let res = ledger
                .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), &format!("i-{}", i))
                .unwrap();
            for (qty, price) in sequence.iter() {
                ledger.commit(&res.handle, *qty, *price, dec!(0.01)).unwrap();
            }
            let settled = ledger.release(&res.handle).unwrap();
            assert!(settled.is_balanced(), "sequence {} leaked", i);
        }

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap.reserved_outstanding, Decimal::ZERO);
        assert_eq!(snap.available + snap.committed_total, dec!(10000));
    }

    #[test]
    fn test_restore_holds_outstanding() {
        let source = ledger(dec!(1000), Decimal::ZERO);
        let res = source
            .reserve("BTC/USDT", Side::Buy, dec!(1), dec!(100), "i-1")
            .unwrap();
        let res = source.commit(&res.handle, dec!(0.5), dec!(100), Decimal::ZERO).unwrap();

        let fresh = ledger(dec!(1000), Decimal::ZERO);
        fresh.restore(&res).unwrap();
        fresh.restore(&res).unwrap();
        assert_eq!(fresh.available(), dec!(950));
        let settled = fresh.release(&res.handle).unwrap();
        assert!(settled.is_balanced());
        assert_eq!(fresh.available(), dec!(1000));
    }

    #[test]
    fn test_peak_rebase_policies() {
        let ledger = BudgetLedger::new(&BudgetConfig {
            initial_capital: dec!(1000),
            reserve_buffer: Decimal::ZERO,
            rolling_peak: Some(dec!(1500)),
            ..BudgetConfig::default()
        });
        ledger.deposit(dec!(200)).unwrap();

        assert_eq!(
            ledger.rebase_peak_with(PeakRebasePolicy::SessionPeak).unwrap(),
            dec!(1200)
        );
        assert_eq!(ledger.drawdown().unwrap(), Decimal::ZERO);

        assert_eq!(
            ledger
                .rebase_peak_with(PeakRebasePolicy::MaxOfSessionAndRolling)
                .unwrap(),
            dec!(1500)
        );
        // 1200 equity against a 1500 peak
        assert_eq!(ledger.drawdown().unwrap(), dec!(0.2));
    }
}
