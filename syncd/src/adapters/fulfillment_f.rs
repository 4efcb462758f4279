use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use super::common::{AdapterCtx, AdapterError};

const PAGE_SIZE: i64 = 50;
const CURSOR_CHECKPOINT_EVERY: usize = 200;

/// fulfillment-F's own status vocabulary mapped onto the shared `fulfillment_status`
/// column. Anything unrecognized falls back to `unfulfilled` rather than erroring,
/// since new upstream statuses shouldn't break a sync run.
pub fn map_fulfillment_status(upstream: &str) -> String {
    match upstream {
        "in-production" => "in_production",
        "sending-to-production" => "in_production",
        "shipping" => "shipped",
        "fulfilled" => "delivered",
        "canceled" => "cancelled",
        _ => "unfulfilled",
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
struct FulfillmentItem {
    cost: Option<PriceObj>,
}

#[derive(Debug, Deserialize)]
struct PriceObj {
    amount: f64,
}

fn price_cents(p: &Option<PriceObj>) -> i64 {
    p.as_ref()
        .map(|p| common_money::cents::from_float(p.amount))
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct FulfillmentOrder {
    id: i64,
    external_id: Option<String>,
    status: String,
    shipments: Option<Vec<Shipment>>,
    line_items: Option<Vec<FulfillmentItem>>,
}

#[derive(Debug, Deserialize)]
struct Shipment {
    cost: Option<PriceObj>,
}

#[derive(Debug, Deserialize)]
struct OrdersPage {
    data: Vec<FulfillmentOrder>,
}

/// fulfillment-F orders: unlike commerce-A/B, this adapter does not support
/// `INSERT ... ON CONFLICT` semantics cleanly because the upstream order may
/// already exist under the commerce-A/B `platform_order_id` (fulfillment-F's
/// `external_id` mirrors the originating order). Resolved Open Question #1: check
/// existence explicitly by `external_id`, then UPDATE fulfillment columns in place
/// or INSERT a new row if the order genuinely originated on fulfillment-F itself.
/// The cursor is checkpointed every 200 processed items rather than only at the end,
/// so a mid-run failure doesn't force a full from-scratch re-sync.
pub async fn run_orders(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_id = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let mut page = account
        .sync_cursor
        .get("orders_page")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);

    let mut synced = 0i64;
    let mut since_checkpoint = 0usize;

    loop {
        let url = format!(
            "https://api.fulfillment-f.example/v1/shops/{shop_id}/orders?page={page}&limit={PAGE_SIZE}"
        );
        let body = ctx
            .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
            .await?;
        let parsed: OrdersPage = serde_json::from_value(body)?;
        let count = parsed.data.len();

        for order in &parsed.data {
            upsert_order_by_existence_check(ctx, order).await?;
            synced += 1;
            since_checkpoint += 1;

            if since_checkpoint >= CURSOR_CHECKPOINT_EVERY {
                checkpoint_cursor(ctx, page).await?;
                since_checkpoint = 0;
            }
        }

        if (count as i64) < PAGE_SIZE {
            break;
        }
        page += 1;
    }

    checkpoint_cursor(ctx, page).await?;
    Ok(synced)
}

async fn checkpoint_cursor(ctx: &AdapterCtx, page: i64) -> Result<(), AdapterError> {
    sqlx::query(
        "UPDATE connected_accounts SET sync_cursor = jsonb_set(sync_cursor, '{orders_page}', to_jsonb($2::bigint)), last_sync_at = now()
         WHERE tenant_id = $1 AND platform = 'fulfillment-F'",
    )
    .bind(ctx.tenant_id)
    .bind(page)
    .execute(&ctx.pool)
    .await?;
    Ok(())
}

async fn upsert_order_by_existence_check(
    ctx: &AdapterCtx,
    order: &FulfillmentOrder,
) -> Result<(), AdapterError> {
    let platform_order_id = order.external_id.clone().unwrap_or_else(|| order.id.to_string());
    let status = map_fulfillment_status(&order.status);

    let production_cost_cents: i64 = order
        .line_items
        .as_ref()
        .map(|items| items.iter().map(|i| price_cents(&i.cost)).sum())
        .unwrap_or(0);
    let shipping_cost_cents: i64 = order
        .shipments
        .as_ref()
        .map(|ships| ships.iter().map(|s| price_cents(&s.cost)).sum())
        .unwrap_or(0);

    let existing: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM orders WHERE tenant_id = $1 AND platform_order_id = $2",
    )
    .bind(ctx.tenant_id)
    .bind(&platform_order_id)
    .fetch_optional(&ctx.pool)
    .await?;

    if let Some(order_id) = existing {
        sqlx::query(
            "UPDATE orders SET fulfillment_status = $2, printify_production_cost_cents = $3,
                printify_shipping_cost_cents = $4
             WHERE id = $1",
        )
        .bind(order_id)
        .bind(&status)
        .bind(production_cost_cents)
        .bind(shipping_cost_cents)
        .execute(&ctx.pool)
        .await?;
    } else {
        sqlx::query(
            "INSERT INTO orders
                (id, tenant_id, platform, platform_order_id, subtotal_cents, shipping_cents,
                 tax_cents, discount_cents, total_cents, ordered_at, fulfillment_status,
                 printify_production_cost_cents, printify_shipping_cost_cents, raw_data)
             VALUES ($1, $2, 'fulfillment-F', $3, 0, 0, 0, 0, 0, now(), $4, $5, $6, '{}'::jsonb)",
        )
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id)
        .bind(&platform_order_id)
        .bind(&status)
        .bind(production_cost_cents)
        .bind(shipping_cost_cents)
        .execute(&ctx.pool)
        .await?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FulfillmentProduct {
    id: i64,
    title: String,
    variants: Option<Vec<Variant>>,
}

#[derive(Debug, Deserialize)]
struct Variant {
    cost: Option<PriceObj>,
}

#[derive(Debug, Deserialize)]
struct ProductsPage {
    data: Vec<FulfillmentProduct>,
}

/// fulfillment-F products: same existence-check variant as orders;
/// `production_cost_cents` takes the minimum cost across variants, matching the
/// "cheapest available SKU" figure merchants actually price against.
pub async fn run_products(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_id = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;

    let mut page = 1i64;
    let mut synced = 0i64;

    loop {
        let url = format!(
            "https://api.fulfillment-f.example/v1/shops/{shop_id}/products?page={page}&limit={PAGE_SIZE}"
        );
        let body = ctx
            .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
            .await?;
        let parsed: ProductsPage = serde_json::from_value(body)?;
        let count = parsed.data.len();

        for product in &parsed.data {
            let min_cost_cents = min_variant_cost_cents(product);

            let existing: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM products WHERE tenant_id = $1 AND platform = 'fulfillment-F' AND platform_product_id = $2",
            )
            .bind(ctx.tenant_id)
            .bind(product.id.to_string())
            .fetch_optional(&ctx.pool)
            .await?;

            if let Some(product_id) = existing {
                sqlx::query(
                    "UPDATE products SET title = $2, production_cost_cents = $3 WHERE id = $1",
                )
                .bind(product_id)
                .bind(&product.title)
                .bind(min_cost_cents)
                .execute(&ctx.pool)
                .await?;
            } else {
                sqlx::query(
                    "INSERT INTO products (id, tenant_id, platform, platform_product_id, title, production_cost_cents, raw_data)
                     VALUES ($1, $2, 'fulfillment-F', $3, $4, $5, '{}'::jsonb)",
                )
                .bind(Uuid::new_v4())
                .bind(ctx.tenant_id)
                .bind(product.id.to_string())
                .bind(&product.title)
                .bind(min_cost_cents)
                .execute(&ctx.pool)
                .await?;
            }
            synced += 1;
        }

        if (count as i64) < PAGE_SIZE {
            break;
        }
        page += 1;
    }

    sqlx::query("UPDATE connected_accounts SET last_sync_at = now() WHERE tenant_id = $1 AND platform = 'fulfillment-F'")
        .bind(ctx.tenant_id)
        .execute(&ctx.pool)
        .await?;

    Ok(synced)
}

fn min_variant_cost_cents(product: &FulfillmentProduct) -> Option<i64> {
    product
        .variants
        .as_ref()
        .and_then(|variants| variants.iter().map(|v| price_cents(&v.cost)).min())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_fulfillment_status_matches_scenario_s3() {
        assert_eq!(map_fulfillment_status("pending"), "unfulfilled");
        assert_eq!(map_fulfillment_status("in-production"), "in_production");
        assert_eq!(map_fulfillment_status("shipping"), "shipped");
        assert_eq!(map_fulfillment_status("fulfilled"), "delivered");
        assert_eq!(map_fulfillment_status("xyz"), "unfulfilled");
    }

    #[test]
    fn map_fulfillment_status_covers_non_literal_spec_examples() {
        assert_eq!(map_fulfillment_status("sending-to-production"), "in_production");
        assert_eq!(map_fulfillment_status("canceled"), "cancelled");
    }

    #[test]
    fn min_variant_cost_picks_cheapest() {
        let product = FulfillmentProduct {
            id: 1,
            title: "Tee".to_string(),
            variants: Some(vec![
                Variant { cost: Some(PriceObj { amount: 8.50 }) },
                Variant { cost: Some(PriceObj { amount: 6.25 }) },
                Variant { cost: Some(PriceObj { amount: 9.00 }) },
            ]),
        };
        assert_eq!(min_variant_cost_cents(&product), Some(625));
    }

    #[test]
    fn min_variant_cost_none_when_no_variants() {
        let product = FulfillmentProduct { id: 1, title: "Tee".to_string(), variants: None };
        assert_eq!(min_variant_cost_cents(&product), None);
    }
}
