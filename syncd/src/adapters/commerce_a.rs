use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use super::common::{AdapterCtx, AdapterError};
use crate::models::Platform;

const PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MoneyObj {
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_divisor")]
    pub divisor: i64,
}

fn default_divisor() -> i64 {
    100
}

/// `to_cents({amount, divisor}) = round(amount * 100 / divisor)`, with the divisor==1
/// quirk meaning `amount` is already a whole-currency-unit integer. A missing object
/// normalizes to 0 cents.
pub fn to_cents(obj: Option<&MoneyObj>) -> i64 {
    match obj {
        None => 0,
        Some(obj) => common_money::cents::from_amount_divisor(obj.amount, obj.divisor),
    }
}

#[derive(Debug, Deserialize)]
struct Transaction {
    transaction_id: i64,
    title: String,
    quantity: i64,
    price: Option<MoneyObj>,
}

#[derive(Debug, Deserialize)]
struct Receipt {
    receipt_id: i64,
    create_timestamp: i64,
    subtotal: Option<MoneyObj>,
    total_shipping_cost: Option<MoneyObj>,
    total_tax_cost: Option<MoneyObj>,
    grandtotal: Option<MoneyObj>,
    discount_amt: Option<MoneyObj>,
    #[serde(default)]
    transactions: Vec<Transaction>,
}

#[derive(Debug, Deserialize)]
struct ReceiptsPage {
    results: Vec<Receipt>,
}

/// commerce-A orders: page receipts by `min_created`, upsert each receipt as an
/// Order on `(tenant, platform, platform_order_id)` and each transaction as a
/// LineItem on `(tenant, order, platform_line_item_id)`. Persists the max
/// `create_timestamp` seen; if any records synced, increments the tenant's billing
/// order counter.
pub async fn run_orders(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_id = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let min_created = account
        .sync_cursor
        .get("orders_last_ts")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let mut offset = 0i64;
    let mut synced = 0i64;
    let mut max_ts = min_created;

    loop {
        let url = format!(
            "https://openapi.etsy.com/v3/application/shops/{shop_id}/receipts?min_created={min_created}&limit={PAGE_SIZE}&offset={offset}"
        );
        let body = ctx
            .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
            .await?;
        let page: ReceiptsPage = serde_json::from_value(body)?;
        let count = page.results.len();

        for receipt in &page.results {
            upsert_order_and_line_items(ctx, receipt).await?;
            synced += 1;
            max_ts = max_ts.max(receipt.create_timestamp);
        }

        if (count as i64) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    let new_cursor = max_ts.max(min_created);
    sqlx::query(
        "UPDATE connected_accounts SET sync_cursor = jsonb_set(sync_cursor, '{orders_last_ts}', to_jsonb($2::bigint)), last_sync_at = now()
         WHERE tenant_id = $1 AND platform = 'commerce-A'",
    )
    .bind(ctx.tenant_id)
    .bind(new_cursor)
    .execute(&ctx.pool)
    .await?;

    if synced > 0 {
        sqlx::query("SELECT increment_order_count($1)")
            .bind(ctx.tenant_id)
            .execute(&ctx.pool)
            .await?;
    }

    Ok(synced)
}

async fn upsert_order_and_line_items(ctx: &AdapterCtx, receipt: &Receipt) -> Result<(), AdapterError> {
    let subtotal_cents = to_cents(receipt.subtotal.as_ref());
    let shipping_cents = to_cents(receipt.total_shipping_cost.as_ref());
    let tax_cents = to_cents(receipt.total_tax_cost.as_ref());
    let discount_cents = to_cents(receipt.discount_amt.as_ref());
    let total_cents = to_cents(receipt.grandtotal.as_ref());
    let ordered_at = timestamp_to_utc(receipt.create_timestamp);
    let platform_order_id = receipt.receipt_id.to_string();

    let order_id: Uuid = sqlx::query_scalar(
        "INSERT INTO orders
            (id, tenant_id, platform, platform_order_id, subtotal_cents, shipping_cents,
             tax_cents, discount_cents, total_cents, ordered_at, raw_data)
         VALUES ($1, $2, 'commerce-A', $3, $4, $5, $6, $7, $8, $9, '{}'::jsonb)
         ON CONFLICT (tenant_id, platform, platform_order_id) DO UPDATE SET
            subtotal_cents = EXCLUDED.subtotal_cents,
            shipping_cents = EXCLUDED.shipping_cents,
            tax_cents = EXCLUDED.tax_cents,
            discount_cents = EXCLUDED.discount_cents,
            total_cents = EXCLUDED.total_cents
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(ctx.tenant_id)
    .bind(&platform_order_id)
    .bind(subtotal_cents)
    .bind(shipping_cents)
    .bind(tax_cents)
    .bind(discount_cents)
    .bind(total_cents)
    .bind(ordered_at)
    .fetch_one(&ctx.pool)
    .await?;

    for txn in &receipt.transactions {
        let unit_price_cents = to_cents(txn.price.as_ref());
        let line_total_cents = unit_price_cents * txn.quantity;
        sqlx::query(
            "INSERT INTO line_items (id, tenant_id, order_id, platform_line_item_id, title, quantity, unit_price_cents, total_cents)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant_id, order_id, platform_line_item_id) DO UPDATE SET
                title = EXCLUDED.title,
                quantity = EXCLUDED.quantity,
                unit_price_cents = EXCLUDED.unit_price_cents,
                total_cents = EXCLUDED.total_cents",
        )
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id)
        .bind(order_id)
        .bind(txn.transaction_id.to_string())
        .bind(&txn.title)
        .bind(txn.quantity as i32)
        .bind(unit_price_cents)
        .bind(line_total_cents)
        .execute(&ctx.pool)
        .await?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct Listing {
    listing_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ListingsPage {
    results: Vec<Listing>,
}

/// commerce-A listings: full `state=active` listing list, upserted on
/// `(tenant, listing_id)`.
pub async fn run_listings(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_id = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;

    let mut offset = 0i64;
    let mut synced = 0i64;

    loop {
        let url = format!(
            "https://openapi.etsy.com/v3/application/shops/{shop_id}/listings/active?limit={PAGE_SIZE}&offset={offset}"
        );
        let body = ctx
            .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
            .await?;
        let page: ListingsPage = serde_json::from_value(body)?;
        let count = page.results.len();

        for listing in &page.results {
            sqlx::query(
                "INSERT INTO products (id, tenant_id, platform, platform_product_id, title, raw_data)
                 VALUES ($1, $2, 'commerce-A', $3, $4, '{}'::jsonb)
                 ON CONFLICT (tenant_id, platform, platform_product_id) DO UPDATE SET
                    title = EXCLUDED.title",
            )
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id)
            .bind(listing.listing_id.to_string())
            .bind(&listing.title)
            .execute(&ctx.pool)
            .await?;
            synced += 1;
        }

        if (count as i64) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    sqlx::query("UPDATE connected_accounts SET last_sync_at = now() WHERE tenant_id = $1 AND platform = 'commerce-A'")
        .bind(ctx.tenant_id)
        .execute(&ctx.pool)
        .await?;

    Ok(synced)
}

#[derive(Debug, Deserialize)]
struct LedgerEntry {
    entry_id: i64,
    amount: Option<MoneyObj>,
    #[serde(rename = "type")]
    entry_type: Option<String>,
    reference_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LedgerPage {
    results: Vec<LedgerEntry>,
}

/// commerce-A payments ledger: maps each ledger entry to a Fee row keyed on the
/// platform ledger id; if it references a receipt id, links the fee to that order.
pub async fn run_payments(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_id = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let min_created = account
        .sync_cursor
        .get("payments_last_ts")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let mut offset = 0i64;
    let mut synced = 0i64;

    loop {
        let url = format!(
            "https://openapi.etsy.com/v3/application/shops/{shop_id}/payment-account/ledger-entries?min_created={min_created}&limit={PAGE_SIZE}&offset={offset}"
        );
        let body = ctx
            .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
            .await?;
        let page: LedgerPage = serde_json::from_value(body)?;
        let count = page.results.len();

        for entry in &page.results {
            let order_id: Option<Uuid> = match entry.reference_id {
                Some(receipt_id) => {
                    sqlx::query_scalar(
                        "SELECT id FROM orders WHERE tenant_id = $1 AND platform = 'commerce-A' AND platform_order_id = $2",
                    )
                    .bind(ctx.tenant_id)
                    .bind(receipt_id.to_string())
                    .fetch_optional(&ctx.pool)
                    .await?
                }
                None => None,
            };

            sqlx::query(
                "INSERT INTO fees (id, tenant_id, platform, platform_ledger_entry_id, order_id, amount_cents, fee_type)
                 VALUES ($1, $2, 'commerce-A', $3, $4, $5, $6)
                 ON CONFLICT (tenant_id, platform, platform_ledger_entry_id) DO UPDATE SET
                    order_id = EXCLUDED.order_id,
                    amount_cents = EXCLUDED.amount_cents,
                    fee_type = EXCLUDED.fee_type",
            )
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id)
            .bind(entry.entry_id.to_string())
            .bind(order_id)
            .bind(to_cents(entry.amount.as_ref()))
            .bind(&entry.entry_type)
            .execute(&ctx.pool)
            .await?;
            synced += 1;
        }

        if (count as i64) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    sqlx::query(
        "UPDATE connected_accounts SET sync_cursor = jsonb_set(sync_cursor, '{payments_last_ts}', to_jsonb($2::bigint)), last_sync_at = now()
         WHERE tenant_id = $1 AND platform = 'commerce-A'",
    )
    .bind(ctx.tenant_id)
    .bind(Utc::now().timestamp().max(min_created))
    .execute(&ctx.pool)
    .await?;

    Ok(synced)
}

fn timestamp_to_utc(epoch_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_secs, 0).single().unwrap_or_else(Utc::now)
}

#[allow(dead_code)]
pub fn platform() -> Platform {
    Platform::CommerceA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_cents_handles_divisor_one_quirk() {
        // S1: to_cents({amount:25,divisor:1}) = 2500
        assert_eq!(to_cents(Some(&MoneyObj { amount: 25, divisor: 1 })), 2500);
    }

    #[test]
    fn to_cents_missing_object_is_zero() {
        // S1: to_cents({}) = 0
        assert_eq!(to_cents(None), 0);
    }

    #[test]
    fn to_cents_normal_divisor() {
        assert_eq!(to_cents(Some(&MoneyObj { amount: 2500, divisor: 100 })), 2500);
        assert_eq!(to_cents(Some(&MoneyObj { amount: 1250, divisor: 100 })), 1250);
    }

    #[test]
    fn scenario_s1_money_normalization() {
        let receipt: Receipt = serde_json::from_value(serde_json::json!({
            "receipt_id": 1,
            "create_timestamp": 1_700_000_000,
            "subtotal": {"amount": 2500, "divisor": 100},
            "grandtotal": {"amount": 3200, "divisor": 100},
            "transactions": [
                {"transaction_id": 1, "title": "Mug", "quantity": 2, "price": {"amount": 1250, "divisor": 100}}
            ]
        }))
        .expect("parse fixture");

        assert_eq!(to_cents(receipt.subtotal.as_ref()), 2500);
        assert_eq!(to_cents(receipt.grandtotal.as_ref()), 3200);
        let txn = &receipt.transactions[0];
        let unit_price_cents = to_cents(txn.price.as_ref());
        assert_eq!(unit_price_cents, 1250);
        assert_eq!(unit_price_cents * txn.quantity, 2500);
    }
}
