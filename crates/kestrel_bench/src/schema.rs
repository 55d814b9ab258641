//! TPC-C-style schemas and key builders for the workload driver.

use kestrel_common::schema::{FieldDef, FieldType, FieldValue, Schema, SerializedRow};
use kestrel_common::types::Key;

pub const WAREHOUSE: &str = "warehouse";
pub const DISTRICT: &str = "district";
pub const CUSTOMER: &str = "customer";
pub const ITEM: &str = "item";
pub const STOCK: &str = "stock";
pub const ORDER: &str = "order";

fn k(field: &FieldValue) -> String {
    field.to_key_string().expect("keyable field")
}

pub fn all_schemas() -> Vec<Schema> {
    vec![
        Schema {
            name: WAREHOUSE.into(),
            version: 1,
            fields: vec![
                FieldDef::new("w_id", FieldType::Int32),
                FieldDef::new("name", FieldType::String),
                FieldDef::new("ytd", FieldType::Float64),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![],
        },
        Schema {
            name: DISTRICT.into(),
            version: 1,
            fields: vec![
                FieldDef::new("w_id", FieldType::Int32),
                FieldDef::new("d_id", FieldType::Int32),
                FieldDef::new("next_o_id", FieldType::Int64),
                FieldDef::new("ytd", FieldType::Float64),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![1],
        },
        Schema {
            name: CUSTOMER.into(),
            version: 1,
            fields: vec![
                FieldDef::new("w_id", FieldType::Int32),
                FieldDef::new("d_id", FieldType::Int32),
                FieldDef::new("c_id", FieldType::Int32),
                FieldDef::new("name", FieldType::String),
                FieldDef::new("balance", FieldType::Float64),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![1, 2],
        },
        Schema {
            name: ITEM.into(),
            version: 1,
            fields: vec![
                FieldDef::new("i_id", FieldType::Int32),
                FieldDef::new("name", FieldType::String),
                FieldDef::new("price", FieldType::Float64),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![],
        },
        Schema {
            name: STOCK.into(),
            version: 1,
            fields: vec![
                FieldDef::new("w_id", FieldType::Int32),
                FieldDef::new("i_id", FieldType::Int32),
                FieldDef::new("quantity", FieldType::Int64),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![1],
        },
        Schema {
            name: ORDER.into(),
            version: 1,
            fields: vec![
                FieldDef::new("w_id", FieldType::Int32),
                FieldDef::new("d_id", FieldType::Int32),
                FieldDef::new("o_id", FieldType::Int64),
                FieldDef::new("c_id", FieldType::Int32),
                FieldDef::new("delivered", FieldType::Bool),
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![1, 2],
        },
    ]
}

/// Encode a warehouse id the way partition range ends are derived.
pub fn warehouse_range_key(w_id: i32) -> String {
    k(&FieldValue::Int32(w_id))
}

pub fn warehouse_key(w_id: i32) -> Key {
    Key::new(WAREHOUSE, k(&FieldValue::Int32(w_id)), "")
}

pub fn warehouse_row(w_id: i32, ytd: f64) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(w_id),
        FieldValue::String(format!("warehouse-{w_id}")),
        FieldValue::Float64(ytd),
    ])
}

pub fn district_key(w_id: i32, d_id: i32) -> Key {
    Key::new(
        DISTRICT,
        k(&FieldValue::Int32(w_id)),
        k(&FieldValue::Int32(d_id)),
    )
}

pub fn district_row(w_id: i32, d_id: i32, next_o_id: i64, ytd: f64) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(w_id),
        FieldValue::Int32(d_id),
        FieldValue::Int64(next_o_id),
        FieldValue::Float64(ytd),
    ])
}

pub fn customer_key(w_id: i32, d_id: i32, c_id: i32) -> Key {
    Key::new(
        CUSTOMER,
        k(&FieldValue::Int32(w_id)),
        format!(
            "{}{}",
            k(&FieldValue::Int32(d_id)),
            k(&FieldValue::Int32(c_id))
        ),
    )
}

pub fn customer_row(w_id: i32, d_id: i32, c_id: i32, balance: f64) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(w_id),
        FieldValue::Int32(d_id),
        FieldValue::Int32(c_id),
        FieldValue::String(format!("customer-{w_id}-{d_id}-{c_id}")),
        FieldValue::Float64(balance),
    ])
}

pub fn item_key(i_id: i32) -> Key {
    Key::new(ITEM, k(&FieldValue::Int32(i_id)), "")
}

pub fn item_row(i_id: i32, price: f64) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(i_id),
        FieldValue::String(format!("item-{i_id}")),
        FieldValue::Float64(price),
    ])
}

pub fn stock_key(w_id: i32, i_id: i32) -> Key {
    Key::new(
        STOCK,
        k(&FieldValue::Int32(w_id)),
        k(&FieldValue::Int32(i_id)),
    )
}

pub fn stock_row(w_id: i32, i_id: i32, quantity: i64) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(w_id),
        FieldValue::Int32(i_id),
        FieldValue::Int64(quantity),
    ])
}

pub fn order_key(w_id: i32, d_id: i32, o_id: i64) -> Key {
    Key::new(
        ORDER,
        k(&FieldValue::Int32(w_id)),
        format!(
            "{}{}",
            k(&FieldValue::Int32(d_id)),
            k(&FieldValue::Int64(o_id))
        ),
    )
}

pub fn order_row(w_id: i32, d_id: i32, o_id: i64, c_id: i32, delivered: bool) -> SerializedRow {
    SerializedRow::full(vec![
        FieldValue::Int32(w_id),
        FieldValue::Int32(d_id),
        FieldValue::Int64(o_id),
        FieldValue::Int32(c_id),
        FieldValue::Bool(delivered),
    ])
}
