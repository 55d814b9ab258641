//! The transaction mix: each variant drives one business transaction through
//! the client and reports whether it committed or fell to an SI abort.

use kestrel_client::{KestrelClient, QueryParams, TxnOptions};
use kestrel_common::api::{EndAction, FieldPredicate, PredicateOp};
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::{FieldValue, SerializedRow};
use kestrel_common::types::Key;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::schema::{self, ORDER};

/// Clamp a requested delivery batch size to the valid range, defaulting to
/// the maximum when absent or out of range.
pub fn clamp_delivery_batch(requested: Option<u32>) -> u32 {
    match requested {
        Some(x) if (1..=10).contains(&x) => x,
        _ => 10,
    }
}

/// One business transaction of the mix.
#[derive(Debug, Clone)]
pub enum TpccTxn {
    NewOrder {
        w_id: i32,
        d_id: i32,
        c_id: i32,
        items: Vec<(i32, i64)>,
    },
    Payment {
        w_id: i32,
        d_id: i32,
        c_id: i32,
        amount: f64,
    },
    OrderStatus {
        w_id: i32,
        d_id: i32,
        c_id: i32,
    },
    Delivery {
        w_id: i32,
        batch_size: u32,
    },
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Aborted,
}

pub struct RunContext {
    pub client: KestrelClient,
    pub collection: String,
}

impl TpccTxn {
    pub fn label(&self) -> &'static str {
        match self {
            TpccTxn::NewOrder { .. } => "new_order",
            TpccTxn::Payment { .. } => "payment",
            TpccTxn::OrderStatus { .. } => "order_status",
            TpccTxn::Delivery { .. } => "delivery",
        }
    }

    /// Execute the transaction. SI aborts roll the transaction back and
    /// report `Aborted`; anything else is surfaced as an error.
    pub async fn run(&self, ctx: &RunContext) -> KestrelResult<Outcome> {
        let mut txn = ctx.client.begin(TxnOptions::default()).await?;
        let body = match self {
            TpccTxn::NewOrder {
                w_id,
                d_id,
                c_id,
                items,
            } => Self::new_order(ctx, &mut txn, *w_id, *d_id, *c_id, items).await,
            TpccTxn::Payment {
                w_id,
                d_id,
                c_id,
                amount,
            } => Self::payment(ctx, &mut txn, *w_id, *d_id, *c_id, *amount).await,
            TpccTxn::OrderStatus { w_id, d_id, c_id } => {
                Self::order_status(ctx, &mut txn, *w_id, *d_id, *c_id).await
            }
            TpccTxn::Delivery { w_id, batch_size } => {
                Self::delivery(ctx, &mut txn, *w_id, *batch_size).await
            }
        };
        match body {
            Ok(()) => match txn.end(&ctx.collection, EndAction::Commit).await {
                Ok(()) => Ok(Outcome::Committed),
                Err(e) if abandons_txn(&e) => Ok(Outcome::Aborted),
                Err(e) => Err(e),
            },
            Err(e) if abandons_txn(&e) => {
                txn.end(&ctx.collection, EndAction::Abort).await.ok();
                Ok(Outcome::Aborted)
            }
            Err(e) => {
                txn.end(&ctx.collection, EndAction::Abort).await.ok();
                Err(e)
            }
        }
    }

    async fn new_order(
        ctx: &RunContext,
        txn: &mut kestrel_client::Txn,
        w_id: i32,
        d_id: i32,
        c_id: i32,
        items: &[(i32, i64)],
    ) -> KestrelResult<()> {
        let dk = schema::district_key(w_id, d_id);
        let district = txn
            .read(&ctx.collection, &dk)
            .await?
            .ok_or(KestrelError::KeyNotFound)?;
        let next_o_id = int64_field(&district, 2)?;
        let ytd = float_field(&district, 3)?;
        txn.write(
            &ctx.collection,
            &dk,
            schema::district_row(w_id, d_id, next_o_id + 1, ytd),
            1,
        )
        .await?;

        for (i_id, qty) in items {
            // Item is read-only reference data.
            txn.read(&ctx.collection, &schema::item_key(*i_id))
                .await?
                .ok_or(KestrelError::KeyNotFound)?;

            let sk = schema::stock_key(w_id, *i_id);
            let stock = txn
                .read(&ctx.collection, &sk)
                .await?
                .ok_or(KestrelError::KeyNotFound)?;
            let mut quantity = int64_field(&stock, 2)?;
            quantity = if quantity >= *qty + 10 {
                quantity - qty
            } else {
                quantity - qty + 91
            };
            txn.write(&ctx.collection, &sk, schema::stock_row(w_id, *i_id, quantity), 1)
                .await?;
        }

        txn.write(
            &ctx.collection,
            &schema::order_key(w_id, d_id, next_o_id),
            schema::order_row(w_id, d_id, next_o_id, c_id, false),
            1,
        )
        .await?;
        Ok(())
    }

    async fn payment(
        ctx: &RunContext,
        txn: &mut kestrel_client::Txn,
        w_id: i32,
        d_id: i32,
        c_id: i32,
        amount: f64,
    ) -> KestrelResult<()> {
        let wk = schema::warehouse_key(w_id);
        let warehouse = txn
            .read(&ctx.collection, &wk)
            .await?
            .ok_or(KestrelError::KeyNotFound)?;
        let w_ytd = float_field(&warehouse, 2)?;
        txn.write(&ctx.collection, &wk, schema::warehouse_row(w_id, w_ytd + amount), 1)
            .await?;

        let dk = schema::district_key(w_id, d_id);
        let district = txn
            .read(&ctx.collection, &dk)
            .await?
            .ok_or(KestrelError::KeyNotFound)?;
        let next_o_id = int64_field(&district, 2)?;
        let d_ytd = float_field(&district, 3)?;
        txn.write(
            &ctx.collection,
            &dk,
            schema::district_row(w_id, d_id, next_o_id, d_ytd + amount),
            1,
        )
        .await?;

        let ck = schema::customer_key(w_id, d_id, c_id);
        let customer = txn
            .read(&ctx.collection, &ck)
            .await?
            .ok_or(KestrelError::KeyNotFound)?;
        let balance = float_field(&customer, 4)?;
        txn.write(
            &ctx.collection,
            &ck,
            schema::customer_row(w_id, d_id, c_id, balance - amount),
            1,
        )
        .await?;
        Ok(())
    }

    async fn order_status(
        ctx: &RunContext,
        txn: &mut kestrel_client::Txn,
        w_id: i32,
        d_id: i32,
        c_id: i32,
    ) -> KestrelResult<()> {
        txn.read(&ctx.collection, &schema::customer_key(w_id, d_id, c_id))
            .await?
            .ok_or(KestrelError::KeyNotFound)?;

        // Most recent orders of this customer's district.
        let pk = schema::warehouse_range_key(w_id);
        txn.query(
            &ctx.collection,
            &QueryParams {
                start: Key::new(ORDER, pk.clone(), "\u{10FFFF}"),
                end: Key::new(ORDER, pk, ""),
                reverse: true,
                limit: Some(5),
                filter: vec![FieldPredicate {
                    field: "c_id".into(),
                    op: PredicateOp::Eq,
                    value: FieldValue::Int32(c_id),
                }],
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn delivery(
        ctx: &RunContext,
        txn: &mut kestrel_client::Txn,
        w_id: i32,
        batch_size: u32,
    ) -> KestrelResult<()> {
        let batch = clamp_delivery_batch(Some(batch_size));
        let pk = schema::warehouse_range_key(w_id);
        let page = txn
            .query(
                &ctx.collection,
                &QueryParams {
                    start: Key::new(ORDER, pk.clone(), ""),
                    end: Key::new(ORDER, pk, "\u{10FFFF}"),
                    limit: Some(batch as usize),
                    filter: vec![FieldPredicate {
                        field: "delivered".into(),
                        op: PredicateOp::Eq,
                        value: FieldValue::Bool(false),
                    }],
                    ..Default::default()
                },
            )
            .await?;

        for row in &page.rows {
            let w_id = int32_field(row, 0)?;
            let d_id = int32_field(row, 1)?;
            let o_id = int64_field(row, 2)?;
            let c_id = int32_field(row, 3)?;
            txn.write(
                &ctx.collection,
                &schema::order_key(w_id, d_id, o_id),
                schema::order_row(w_id, d_id, o_id, c_id, true),
                1,
            )
            .await?;
        }
        Ok(())
    }
}

/// True for errors that abort this transaction without failing the driver:
/// SI conflicts, and the commit rejection after a force-abort.
fn abandons_txn(e: &KestrelError) -> bool {
    e.is_si_abort() || matches!(e, KestrelError::OperationNotAllowed(_))
}

fn int32_field(row: &SerializedRow, idx: usize) -> KestrelResult<i32> {
    match row.get(idx) {
        Some(FieldValue::Int32(v)) => Ok(*v),
        other => Err(KestrelError::BadParameter(format!(
            "expected int32 at field {idx}, got {other:?}"
        ))),
    }
}

fn int64_field(row: &SerializedRow, idx: usize) -> KestrelResult<i64> {
    match row.get(idx) {
        Some(FieldValue::Int64(v)) => Ok(*v),
        other => Err(KestrelError::BadParameter(format!(
            "expected int64 at field {idx}, got {other:?}"
        ))),
    }
}

fn float_field(row: &SerializedRow, idx: usize) -> KestrelResult<f64> {
    match row.get(idx) {
        Some(FieldValue::Float64(v)) => Ok(*v),
        other => Err(KestrelError::BadParameter(format!(
            "expected float64 at field {idx}, got {other:?}"
        ))),
    }
}

/// Weighted pick from the standard mix.
pub fn pick_txn(rng: &mut SmallRng, warehouses: i32, delivery_batch: Option<u32>) -> TpccTxn {
    let w_id = rng.gen_range(1..=warehouses);
    let d_id = rng.gen_range(1..=crate::datagen::DISTRICTS_PER_WAREHOUSE);
    let c_id = rng.gen_range(1..=crate::datagen::CUSTOMERS_PER_DISTRICT);
    match rng.gen_range(0u32..100) {
        0..=44 => {
            let count = rng.gen_range(1..=5);
            let items = (0..count)
                .map(|_| {
                    (
                        rng.gen_range(1..=crate::datagen::ITEM_COUNT),
                        rng.gen_range(1i64..=5),
                    )
                })
                .collect();
            TpccTxn::NewOrder {
                w_id,
                d_id,
                c_id,
                items,
            }
        }
        45..=87 => TpccTxn::Payment {
            w_id,
            d_id,
            c_id,
            amount: f64::from(rng.gen_range(1u32..=5_000)) / 100.0,
        },
        88..=95 => TpccTxn::OrderStatus { w_id, d_id, c_id },
        _ => TpccTxn::Delivery {
            w_id,
            batch_size: clamp_delivery_batch(delivery_batch),
        },
    }
}
