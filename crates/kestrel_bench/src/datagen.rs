//! Initial data load: warehouses, districts, customers, items and stock,
//! written through ordinary transactions so the load path exercises the same
//! machinery as the mix.

use kestrel_client::{KestrelClient, TxnOptions};
use kestrel_common::error::KestrelResult;

use crate::schema;

pub const DISTRICTS_PER_WAREHOUSE: i32 = 4;
pub const CUSTOMERS_PER_DISTRICT: i32 = 10;
pub const ITEM_COUNT: i32 = 100;
const ROWS_PER_LOAD_TXN: usize = 32;

pub async fn load(client: &KestrelClient, collection: &str, warehouses: i32) -> KestrelResult<()> {
    let mut pending: Vec<(kestrel_common::types::Key, kestrel_common::schema::SerializedRow)> =
        Vec::new();

    for i_id in 1..=ITEM_COUNT {
        pending.push((
            schema::item_key(i_id),
            schema::item_row(i_id, f64::from(i_id % 97) + 1.0),
        ));
    }
    for w_id in 1..=warehouses {
        pending.push((schema::warehouse_key(w_id), schema::warehouse_row(w_id, 0.0)));
        for d_id in 1..=DISTRICTS_PER_WAREHOUSE {
            pending.push((
                schema::district_key(w_id, d_id),
                schema::district_row(w_id, d_id, 1, 0.0),
            ));
            for c_id in 1..=CUSTOMERS_PER_DISTRICT {
                pending.push((
                    schema::customer_key(w_id, d_id, c_id),
                    schema::customer_row(w_id, d_id, c_id, 1_000.0),
                ));
            }
        }
        for i_id in 1..=ITEM_COUNT {
            pending.push((
                schema::stock_key(w_id, i_id),
                schema::stock_row(w_id, i_id, 100),
            ));
        }
    }

    let total = pending.len();
    for chunk in pending.chunks(ROWS_PER_LOAD_TXN) {
        let mut txn = client.begin(TxnOptions::default()).await?;
        for (key, row) in chunk {
            txn.write(collection, key, row.clone(), 1).await?;
        }
        txn.commit(collection).await?;
    }
    tracing::info!(rows = total, warehouses, "data load complete");
    Ok(())
}
