use chrono::Utc;
use cyder_tools::log::{error, info, warn};

use crate::database::account::Account;
use crate::database::api_key::ApiKey;
use crate::database::referral::{ReferralReward, SystemSetting};
use crate::database::transaction::AccountTransaction;
use crate::database::usage_log::UsageLog;
use crate::database::{Database, DbConnection, DbResult};
use crate::error::BaseError;
use crate::schema::enum_def::{TransactionType, UsageStatus};
use crate::utils::billing::{compute_charge, format_micros, Charge, PriceSheet, TokenUsage};
use crate::utils::ID_GENERATOR;

/// Everything settlement needs to know about one finished request.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub request_id: i64,
    pub account_id: i64,
    pub api_key_id: i64,
    /// Quota-bound keys spend `used_quota` instead of the account balance.
    pub quota_bound: bool,
    pub model_name: String,
    pub channel_id: Option<i64>,
    pub usage: TokenUsage,
    pub prices: PriceSheet,
    pub status: UsageStatus,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub is_stream: bool,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Usage record written; balance or quota mutated for billable statuses.
    Settled { status: UsageStatus, charge: Charge },
    /// The guarded debit failed. The usage record carries this status and
    /// nothing was mutated.
    Rejected { status: UsageStatus, charge: Charge },
    /// A usage record for this request id already exists.
    AlreadySettled,
}

enum Debit {
    Balance(i64),
    Quota,
    Nothing,
}

/// Settles one request in a single store transaction: guarded debit, usage
/// record keyed by request id, then the ledger entry.
pub fn settle_usage(conn: &mut DbConnection, record: &SettlementRecord) -> DbResult<SettlementOutcome> {
    let charge = compute_charge(&record.usage, &record.prices);

    let result = conn.transaction(|conn| {
        let mut status = record.status;
        let mut debit = Debit::Nothing;

        if status.is_billable() && charge.revenue > 0 {
            if record.quota_bound {
                match ApiKey::consume_quota(conn, record.api_key_id, charge.revenue)? {
                    Some(_) => debit = Debit::Quota,
                    None => status = UsageStatus::QuotaExceeded,
                }
            } else {
                match Account::debit_if_sufficient(conn, record.account_id, charge.revenue)? {
                    Some(balance) => debit = Debit::Balance(balance),
                    None => status = UsageStatus::InsufficientBalance,
                }
            }
        }

        let log = UsageLog {
            id: record.request_id,
            account_id: record.account_id,
            api_key_id: record.api_key_id,
            model_name: record.model_name.clone(),
            channel_id: record.channel_id,
            prompt_tokens: record.usage.prompt_tokens,
            completion_tokens: record.usage.completion_tokens,
            total_tokens: record.usage.total(),
            cost: charge.cost,
            revenue: charge.revenue,
            duration_ms: record.duration_ms,
            status,
            error_message: record.error_message.clone(),
            client_ip: record.client_ip.clone(),
            is_stream: record.is_stream,
            created_at: Utc::now().timestamp_millis(),
        };
        if !UsageLog::insert_once(conn, &log)? {
            // Rolls back the debit above.
            return Err(BaseError::DatabaseDup(Some(format!(
                "request {} already settled",
                record.request_id
            ))));
        }

        if let Debit::Balance(balance_after) = debit {
            AccountTransaction::record(
                conn,
                record.account_id,
                TransactionType::Usage,
                -charge.revenue,
                balance_after,
                Some(record.request_id),
                Some(format!("{} usage", record.model_name)),
            )?;
        }

        Ok(if status == record.status {
            SettlementOutcome::Settled { status, charge }
        } else {
            SettlementOutcome::Rejected { status, charge }
        })
    });

    match result {
        Err(BaseError::DatabaseDup(_)) => Ok(SettlementOutcome::AlreadySettled),
        other => other,
    }
}

/// Async entry used by the request path.
pub async fn settle(db: &Database, record: SettlementRecord) -> DbResult<SettlementOutcome> {
    let request_id = record.request_id;
    let outcome = db.run(move |conn| settle_usage(conn, &record)).await?;
    match &outcome {
        SettlementOutcome::Settled { status, charge } => info!(
            "request {} settled: status={:?} revenue={} cost={}",
            request_id,
            status,
            format_micros(charge.revenue),
            format_micros(charge.cost)
        ),
        SettlementOutcome::Rejected { status, charge } => warn!(
            "request {} not debited ({:?}), revenue {} left unpaid",
            request_id,
            status,
            format_micros(charge.revenue)
        ),
        SettlementOutcome::AlreadySettled => warn!("request {} was already settled", request_id),
    }
    Ok(outcome)
}

#[derive(Debug, Clone)]
pub struct TopUpOutcome {
    pub transaction: AccountTransaction,
    pub commission: Option<ReferralReward>,
}

/// Credits a top-up and pays the referrer's commission. Commission failures
/// are logged and never undo the top-up.
pub fn apply_top_up(
    conn: &mut DbConnection,
    account_id: i64,
    amount: i64,
    description: Option<String>,
) -> DbResult<TopUpOutcome> {
    if amount <= 0 {
        return Err(BaseError::ParamInvalid(Some("top-up amount must be positive".to_string())));
    }

    let transaction = conn.transaction(|conn| {
        let balance = Account::credit(conn, account_id, amount)?;
        AccountTransaction::record(
            conn,
            account_id,
            TransactionType::Topup,
            amount,
            balance,
            None,
            description,
        )
    })?;
    info!("account {} topped up by {}", account_id, format_micros(amount));

    let commission = match pay_referral_commission(conn, account_id, &transaction) {
        Ok(reward) => reward,
        Err(e) => {
            error!(
                "referral commission for top-up {} failed, skipping: {}",
                transaction.id, e
            );
            None
        }
    };

    Ok(TopUpOutcome {
        transaction,
        commission,
    })
}

fn pay_referral_commission(
    conn: &mut DbConnection,
    referee_id: i64,
    top_up: &AccountTransaction,
) -> DbResult<Option<ReferralReward>> {
    let Some(referrer_id) = Account::get(conn, referee_id)?.referrer_id else {
        return Ok(None);
    };
    let rate_bps = SystemSetting::commission_rate_bps(conn)?;
    let amount = (top_up.amount as i128 * rate_bps as i128 / 10_000) as i64;
    if amount <= 0 {
        return Ok(None);
    }

    let reward = ReferralReward {
        id: ID_GENERATOR.generate_id(),
        referrer_id,
        referee_id,
        source_transaction_id: top_up.id,
        amount,
        rate_bps: rate_bps as i32,
        created_at: Utc::now().timestamp_millis(),
    };

    conn.transaction(|conn| {
        // Unique on source_transaction_id: a second payout fails here.
        ReferralReward::insert(conn, &reward)?;
        let balance = Account::credit(conn, referrer_id, amount)?;
        AccountTransaction::record(
            conn,
            referrer_id,
            TransactionType::Referral,
            amount,
            balance,
            Some(top_up.id),
            Some(format!("referral commission from account {}", referee_id)),
        )?;
        Ok(())
    })?;
    info!(
        "paid referral commission {} to account {}",
        format_micros(amount),
        referrer_id
    );
    Ok(Some(reward))
}

/// Operator balance correction. Refused when it would leave the balance
/// negative; never pays commission.
pub fn apply_adjustment(
    conn: &mut DbConnection,
    account_id: i64,
    delta: i64,
    description: Option<String>,
) -> DbResult<AccountTransaction> {
    conn.transaction(|conn| {
        let balance = Account::adjust_non_negative(conn, account_id, delta)?.ok_or_else(|| {
            BaseError::ParamInvalid(Some(format!(
                "adjustment of {} would make account {} negative",
                format_micros(delta),
                account_id
            )))
        })?;
        AccountTransaction::record(
            conn,
            account_id,
            TransactionType::Adjustment,
            delta,
            balance,
            None,
            description,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::referral::REFERRAL_COMMISSION_BPS;
    use crate::database::test_support::test_db;
    use std::thread;

    // 1.0 per million prompt tokens in, 2.0 per million out, sold at double.
    const PRICES: PriceSheet = PriceSheet {
        input_cost: 1_000_000,
        output_cost: 2_000_000,
        input_price: 2_000_000,
        output_price: 4_000_000,
    };

    fn insert_key(conn: &mut DbConnection, id: i64, account_id: i64, total_quota: Option<i64>) {
        ApiKey::insert(
            conn,
            &ApiKey {
                id,
                account_id,
                key_hash: format!("hash-{}", id),
                label: "test".to_string(),
                is_active: true,
                total_quota,
                model_whitelist: "[]".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    }

    fn record(request_id: i64, account_id: i64, api_key_id: i64, usage: TokenUsage) -> SettlementRecord {
        SettlementRecord {
            request_id,
            account_id,
            api_key_id,
            quota_bound: false,
            model_name: "gpt-4o-mini".to_string(),
            channel_id: Some(1),
            usage,
            prices: PRICES,
            status: UsageStatus::Success,
            error_message: None,
            client_ip: Some("127.0.0.1".to_string()),
            is_stream: false,
            duration_ms: 12,
        }
    }

    #[test]
    fn test_success_debits_balance_and_writes_ledger() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "alice", None).unwrap();
        insert_key(&mut conn, 1, acc.id, None);
        apply_top_up(&mut conn, acc.id, 1_000_000, None).unwrap();

        // 1000 in * 2.0/M + 500 out * 4.0/M = 0.004
        let outcome = settle_usage(&mut conn, &record(100, acc.id, 1, TokenUsage::new(1000, 500))).unwrap();

        assert_eq!(
            outcome,
            SettlementOutcome::Settled {
                status: UsageStatus::Success,
                charge: Charge { cost: 2_000, revenue: 4_000 }
            }
        );
        assert_eq!(Account::balance(&mut conn, acc.id).unwrap(), 996_000);
        let log = UsageLog::get(&mut conn, 100).unwrap().unwrap();
        assert_eq!(log.total_tokens, 1500);
        assert_eq!(log.status, UsageStatus::Success);
        let ledger = AccountTransaction::list_by_account(&mut conn, acc.id).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].amount, -4_000);
        assert_eq!(ledger[1].balance_after, 996_000);
        assert_eq!(ledger[1].reference_id, Some(100));
    }

    #[test]
    fn test_settlement_is_idempotent() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "bob", None).unwrap();
        insert_key(&mut conn, 1, acc.id, None);
        apply_top_up(&mut conn, acc.id, 1_000_000, None).unwrap();

        let rec = record(7, acc.id, 1, TokenUsage::new(1000, 0));
        assert!(matches!(settle_usage(&mut conn, &rec).unwrap(), SettlementOutcome::Settled { .. }));
        assert_eq!(settle_usage(&mut conn, &rec).unwrap(), SettlementOutcome::AlreadySettled);

        assert_eq!(Account::balance(&mut conn, acc.id).unwrap(), 998_000);
        assert_eq!(UsageLog::list_by_api_key(&mut conn, 1).unwrap().len(), 1);
        assert_eq!(AccountTransaction::list_by_account(&mut conn, acc.id).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_request_is_logged_without_mutation() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "carol", None).unwrap();
        insert_key(&mut conn, 1, acc.id, None);
        apply_top_up(&mut conn, acc.id, 1_000, None).unwrap();

        let mut rec = record(9, acc.id, 1, TokenUsage::new(40, 3));
        rec.status = UsageStatus::UpstreamError;
        rec.error_message = Some("connection reset".to_string());
        let outcome = settle_usage(&mut conn, &rec).unwrap();

        assert!(matches!(outcome, SettlementOutcome::Settled { status: UsageStatus::UpstreamError, .. }));
        assert_eq!(Account::balance(&mut conn, acc.id).unwrap(), 1_000);
        let log = UsageLog::get(&mut conn, 9).unwrap().unwrap();
        assert_eq!(log.prompt_tokens, 40);
        assert_eq!(log.error_message.as_deref(), Some("connection reset"));
        assert_eq!(AccountTransaction::list_by_account(&mut conn, acc.id).unwrap().len(), 1);
    }

    #[test]
    fn test_insufficient_balance_is_recorded() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let acc = Account::create(&mut conn, "dave", None).unwrap();
        insert_key(&mut conn, 1, acc.id, None);
        apply_top_up(&mut conn, acc.id, 10, None).unwrap();

        let outcome = settle_usage(&mut conn, &record(11, acc.id, 1, TokenUsage::new(1000, 0))).unwrap();

        assert!(matches!(
            outcome,
            SettlementOutcome::Rejected { status: UsageStatus::InsufficientBalance, .. }
        ));
        assert_eq!(Account::balance(&mut conn, acc.id).unwrap(), 10);
        assert_eq!(
            UsageLog::get(&mut conn, 11).unwrap().unwrap().status,
            UsageStatus::InsufficientBalance
        );
    }

    #[test]
    fn test_concurrent_quota_never_overspends() {
        let t = test_db();
        let account_id = {
            let mut conn = t.db.get_connection().unwrap();
            let acc = Account::create(&mut conn, "quota", None).unwrap();
            // each request costs 2_000; room for exactly 10
            insert_key(&mut conn, 5, acc.id, Some(20_000));
            acc.id
        };

        let handles: Vec<_> = (0..14)
            .map(|i| {
                let db = t.db.clone();
                thread::spawn(move || {
                    let mut conn = db.get_connection().unwrap();
                    let mut rec = record(1_000 + i, account_id, 5, TokenUsage::new(1000, 0));
                    rec.quota_bound = true;
                    settle_usage(&mut conn, &rec).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let settled = outcomes
            .iter()
            .filter(|o| matches!(o, SettlementOutcome::Settled { .. }))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, SettlementOutcome::Rejected { status: UsageStatus::QuotaExceeded, .. }))
            .count();
        assert_eq!(settled, 10);
        assert_eq!(rejected, 4);

        let mut conn = t.db.get_connection().unwrap();
        assert_eq!(ApiKey::get_by_id(&mut conn, 5).unwrap().used_quota, 20_000);
        assert_eq!(Account::balance(&mut conn, account_id).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_balance_debits_reconstruct_ledger() {
        let t = test_db();
        let account_id = {
            let mut conn = t.db.get_connection().unwrap();
            let acc = Account::create(&mut conn, "ledger", None).unwrap();
            insert_key(&mut conn, 1, acc.id, None);
            apply_top_up(&mut conn, acc.id, 15_000, None).unwrap();
            acc.id
        };

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let db = t.db.clone();
                thread::spawn(move || {
                    let mut conn = db.get_connection().unwrap();
                    settle_usage(&mut conn, &record(2_000 + i, account_id, 1, TokenUsage::new(1000, 0))).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut conn = t.db.get_connection().unwrap();
        apply_adjustment(&mut conn, account_id, 500, Some("goodwill".to_string())).unwrap();
        assert!(apply_adjustment(&mut conn, account_id, -1_000_000, None).is_err());

        let balance = Account::balance(&mut conn, account_id).unwrap();
        let ledger = AccountTransaction::list_by_account(&mut conn, account_id).unwrap();
        // 15_000 covers seven 2_000 debits
        assert_eq!(balance, 15_000 - 7 * 2_000 + 500);
        assert_eq!(ledger.iter().map(|t| t.amount).sum::<i64>(), balance);
        let mut sorted_snapshots: Vec<i64> = ledger.iter().map(|t| t.balance_after).collect();
        sorted_snapshots.sort();
        assert!(sorted_snapshots.contains(&balance));
    }

    #[test]
    fn test_referral_commission_only_on_top_up() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        let referrer = Account::create(&mut conn, "referrer", None).unwrap();
        let referee = Account::create(&mut conn, "referee", Some(referrer.id)).unwrap();
        insert_key(&mut conn, 1, referee.id, None);
        SystemSetting::set(&mut conn, REFERRAL_COMMISSION_BPS, "1000").unwrap();

        let outcome = apply_top_up(&mut conn, referee.id, 500_000, None).unwrap();
        let reward = outcome.commission.unwrap();
        assert_eq!(reward.amount, 50_000);
        assert_eq!(reward.source_transaction_id, outcome.transaction.id);
        assert_eq!(Account::balance(&mut conn, referrer.id).unwrap(), 50_000);

        settle_usage(&mut conn, &record(3, referee.id, 1, TokenUsage::new(1000, 0))).unwrap();
        apply_adjustment(&mut conn, referee.id, 1_000, None).unwrap();
        assert_eq!(Account::balance(&mut conn, referrer.id).unwrap(), 50_000);
        assert_eq!(ReferralReward::list_by_referrer(&mut conn, referrer.id).unwrap().len(), 1);

        let ledger = AccountTransaction::list_by_account(&mut conn, referrer.id).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].transaction_type, TransactionType::Referral);
    }

    #[test]
    fn test_commission_failure_keeps_top_up() {
        let t = test_db();
        let mut conn = t.db.get_connection().unwrap();
        // referrer id points at nothing, so the credit fails
        let referee = Account::create(&mut conn, "orphan", Some(424_242)).unwrap();
        SystemSetting::set(&mut conn, REFERRAL_COMMISSION_BPS, "500").unwrap();

        let outcome = apply_top_up(&mut conn, referee.id, 100_000, None).unwrap();

        assert!(outcome.commission.is_none());
        assert_eq!(Account::balance(&mut conn, referee.id).unwrap(), 100_000);
    }
}
