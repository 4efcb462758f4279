use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::common::AdapterCtx;
use super::common::AdapterError;

const PAGE_SIZE: i64 = 50;

/// commerce-B identifiers are GraphQL GIDs like `gid://commerce-b/Order/123456789`;
/// every upsert keys on the numeric tail, never the full GID.
pub fn gid_tail(gid: &str) -> &str {
    gid.rsplit('/').next().unwrap_or(gid)
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    edges: Vec<Edge<T>>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct MoneySet {
    #[serde(rename = "shopMoney")]
    shop_money: ShopMoney,
}

#[derive(Debug, Deserialize)]
struct ShopMoney {
    amount: String,
}

fn money_set_cents(m: &Option<MoneySet>) -> i64 {
    m.as_ref()
        .and_then(|m| common_money::cents::from_decimal_str(&m.shop_money.amount))
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct OrderLineItem {
    id: String,
    title: String,
    quantity: i64,
    #[serde(rename = "originalUnitPriceSet")]
    original_unit_price_set: Option<MoneySet>,
}

#[derive(Debug, Deserialize)]
struct OrderLineItemsConnection {
    edges: Vec<Edge<OrderLineItem>>,
}

#[derive(Debug, Deserialize)]
struct OrderNode {
    id: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "subtotalPriceSet")]
    subtotal_price_set: Option<MoneySet>,
    #[serde(rename = "totalShippingPriceSet")]
    total_shipping_price_set: Option<MoneySet>,
    #[serde(rename = "totalTaxSet")]
    total_tax_set: Option<MoneySet>,
    #[serde(rename = "totalDiscountsSet")]
    total_discounts_set: Option<MoneySet>,
    #[serde(rename = "totalPriceSet")]
    total_price_set: Option<MoneySet>,
    #[serde(rename = "lineItems")]
    line_items: OrderLineItemsConnection,
}

#[derive(Debug, Deserialize)]
struct OrdersData {
    orders: Connection<OrderNode>,
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    data: OrdersData,
}

const ORDERS_QUERY: &str = r#"
query Orders($cursor: String, $pageSize: Int!) {
  orders(first: $pageSize, after: $cursor) {
    edges {
      node {
        id
        createdAt
        subtotalPriceSet { shopMoney { amount } }
        totalShippingPriceSet { shopMoney { amount } }
        totalTaxSet { shopMoney { amount } }
        totalDiscountsSet { shopMoney { amount } }
        totalPriceSet { shopMoney { amount } }
        lineItems(first: 50) {
          edges { node { id title quantity originalUnitPriceSet { shopMoney { amount } } } }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

/// commerce-B orders: cursor-based pagination via an opaque GraphQL `endCursor`
/// string, persisted verbatim and never parsed as a timestamp (Open Question #2).
pub async fn run_orders(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_domain = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let mut cursor = account
        .sync_cursor
        .get("orders_cursor")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let url = format!("https://{shop_domain}/admin/api/2024-01/graphql.json");
    let mut synced = 0i64;

    loop {
        let body = ctx
            .call_json(Method::POST, &url, |b, token| {
                b.header("X-Commerce-B-Access-Token", token).json(&json!({
                    "query": ORDERS_QUERY,
                    "variables": { "cursor": cursor, "pageSize": PAGE_SIZE },
                }))
            })
            .await?;
        let parsed: OrdersResponse = serde_json::from_value(body)?;
        let connection = parsed.data.orders;

        for edge in &connection.edges {
            upsert_order(ctx, &edge.node).await?;
            synced += 1;
        }

        cursor = connection.page_info.end_cursor.clone();
        if !connection.page_info.has_next_page {
            break;
        }
    }

    if let Some(cursor) = cursor {
        sqlx::query(
            "UPDATE connected_accounts SET sync_cursor = jsonb_set(sync_cursor, '{orders_cursor}', to_jsonb($2::text)), last_sync_at = now()
             WHERE tenant_id = $1 AND platform = 'commerce-B'",
        )
        .bind(ctx.tenant_id)
        .bind(&cursor)
        .execute(&ctx.pool)
        .await?;
    }

    Ok(synced)
}

async fn upsert_order(ctx: &AdapterCtx, node: &OrderNode) -> Result<(), AdapterError> {
    let platform_order_id = gid_tail(&node.id).to_string();
    let ordered_at = node
        .created_at
        .parse::<chrono::DateTime<chrono::Utc>>()
        .unwrap_or_else(|_| chrono::Utc::now());

    let order_id: Uuid = sqlx::query_scalar(
        "INSERT INTO orders
            (id, tenant_id, platform, platform_order_id, subtotal_cents, shipping_cents,
             tax_cents, discount_cents, total_cents, ordered_at, raw_data)
         VALUES ($1, $2, 'commerce-B', $3, $4, $5, $6, $7, $8, $9, '{}'::jsonb)
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
    .bind(money_set_cents(&node.subtotal_price_set))
    .bind(money_set_cents(&node.total_shipping_price_set))
    .bind(money_set_cents(&node.total_tax_set))
    .bind(money_set_cents(&node.total_discounts_set))
    .bind(money_set_cents(&node.total_price_set))
    .bind(ordered_at)
    .fetch_one(&ctx.pool)
    .await?;

    for edge in &node.line_items.edges {
        let item = &edge.node;
        let unit_price_cents = money_set_cents(&item.original_unit_price_set);
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
        .bind(gid_tail(&item.id))
        .bind(&item.title)
        .bind(item.quantity as i32)
        .bind(unit_price_cents)
        .bind(unit_price_cents * item.quantity)
        .execute(&ctx.pool)
        .await?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct ProductNode {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    products: Connection<ProductNode>,
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    data: ProductsData,
}

const PRODUCTS_QUERY: &str = r#"
query Products($cursor: String, $pageSize: Int!) {
  products(first: $pageSize, after: $cursor) {
    edges { node { id title } }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

pub async fn run_products(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_domain = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let url = format!("https://{shop_domain}/admin/api/2024-01/graphql.json");

    let mut cursor: Option<String> = None;
    let mut synced = 0i64;

    loop {
        let body = ctx
            .call_json(Method::POST, &url, |b, token| {
                b.header("X-Commerce-B-Access-Token", token).json(&json!({
                    "query": PRODUCTS_QUERY,
                    "variables": { "cursor": cursor, "pageSize": PAGE_SIZE },
                }))
            })
            .await?;
        let parsed: ProductsResponse = serde_json::from_value(body)?;
        let connection = parsed.data.products;

        for edge in &connection.edges {
            sqlx::query(
                "INSERT INTO products (id, tenant_id, platform, platform_product_id, title, raw_data)
                 VALUES ($1, $2, 'commerce-B', $3, $4, '{}'::jsonb)
                 ON CONFLICT (tenant_id, platform, platform_product_id) DO UPDATE SET
                    title = EXCLUDED.title",
            )
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id)
            .bind(gid_tail(&edge.node.id))
            .bind(&edge.node.title)
            .execute(&ctx.pool)
            .await?;
            synced += 1;
        }

        cursor = connection.page_info.end_cursor.clone();
        if !connection.page_info.has_next_page {
            break;
        }
    }

    sqlx::query("UPDATE connected_accounts SET last_sync_at = now() WHERE tenant_id = $1 AND platform = 'commerce-B'")
        .bind(ctx.tenant_id)
        .execute(&ctx.pool)
        .await?;

    Ok(synced)
}

#[derive(Debug, Deserialize)]
struct CustomerNode {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomersData {
    customers: Connection<CustomerNode>,
}

#[derive(Debug, Deserialize)]
struct CustomersResponse {
    data: CustomersData,
}

const CUSTOMERS_QUERY: &str = r#"
query Customers($cursor: String, $pageSize: Int!) {
  customers(first: $pageSize, after: $cursor) {
    edges { node { id email } }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

pub async fn run_customers(ctx: &AdapterCtx) -> Result<i64, AdapterError> {
    let account = ctx.connected_account().await?;
    let shop_domain = account
        .shop_identifier
        .clone()
        .ok_or(AdapterError::NoCredentials)?;
    let url = format!("https://{shop_domain}/admin/api/2024-01/graphql.json");

    let mut cursor: Option<String> = None;
    let mut synced = 0i64;

    loop {
        let body = ctx
            .call_json(Method::POST, &url, |b, token| {
                b.header("X-Commerce-B-Access-Token", token).json(&json!({
                    "query": CUSTOMERS_QUERY,
                    "variables": { "cursor": cursor, "pageSize": PAGE_SIZE },
                }))
            })
            .await?;
        let parsed: CustomersResponse = serde_json::from_value(body)?;
        let connection = parsed.data.customers;

        for edge in &connection.edges {
            sqlx::query(
                "INSERT INTO customers (id, tenant_id, platform, platform_customer_id, email, raw_data)
                 VALUES ($1, $2, 'commerce-B', $3, $4, '{}'::jsonb)
                 ON CONFLICT (tenant_id, platform, platform_customer_id) DO UPDATE SET
                    email = EXCLUDED.email",
            )
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id)
            .bind(gid_tail(&edge.node.id))
            .bind(&edge.node.email)
            .execute(&ctx.pool)
            .await?;
            synced += 1;
        }

        cursor = connection.page_info.end_cursor.clone();
        if !connection.page_info.has_next_page {
            break;
        }
    }

    sqlx::query("UPDATE connected_accounts SET last_sync_at = now() WHERE tenant_id = $1 AND platform = 'commerce-B'")
        .bind(ctx.tenant_id)
        .execute(&ctx.pool)
        .await?;

    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_tail_extracts_numeric_suffix() {
        assert_eq!(gid_tail("gid://commerce-b/Order/123456789"), "123456789");
        assert_eq!(gid_tail("gid://commerce-b/LineItem/987"), "987");
        assert_eq!(gid_tail("plain-id"), "plain-id");
    }

    #[test]
    fn money_set_cents_parses_decimal_string() {
        let m = Some(MoneySet {
            shop_money: ShopMoney { amount: "32.00".to_string() },
        });
        assert_eq!(money_set_cents(&m), 3200);
    }

    #[test]
    fn money_set_cents_missing_is_zero() {
        assert_eq!(money_set_cents(&None), 0);
    }
}
