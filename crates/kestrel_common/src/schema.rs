use serde::{Deserialize, Serialize};

/// Wire type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
}

impl FieldType {
    /// Whether the type has an order-preserving key encoding and may appear
    /// in partition/range key fields.
    pub fn is_keyable(&self) -> bool {
        !matches!(self, FieldType::Float64)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Float64(_) => FieldType::Float64,
            FieldValue::String(_) => FieldType::String,
        }
    }

    /// Compare two values of the same type; None when the types differ or
    /// the comparison is undefined (NaN).
    pub fn compare(&self, other: &FieldValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Int32(a), FieldValue::Int32(b)) => Some(a.cmp(b)),
            (FieldValue::Int64(a), FieldValue::Int64(b)) => Some(a.cmp(b)),
            (FieldValue::Float64(a), FieldValue::Float64(b)) => a.partial_cmp(b),
            (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Order-preserving string encoding for key construction.
    ///
    /// Integers are sign-biased and rendered as fixed-width hex so that the
    /// string order matches the numeric order. Returns None for types with no
    /// key encoding.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            FieldValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            FieldValue::Int32(v) => Some(format!("{:08x}", (*v as u32) ^ (1u32 << 31))),
            FieldValue::Int64(v) => Some(format!("{:016x}", (*v as u64) ^ (1u64 << 63))),
            FieldValue::Float64(_) => None,
            FieldValue::String(s) => Some(s.clone()),
        }
    }
}

/// A field definition: name plus wire type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A positional row encoded against one schema version. `None` marks a field
/// the writer did not set (partial updates fill these from the previous
/// version).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerializedRow {
    pub fields: Vec<Option<FieldValue>>,
}

impl SerializedRow {
    pub fn new(fields: Vec<Option<FieldValue>>) -> Self {
        Self { fields }
    }

    /// A row with every field set, in schema order.
    pub fn full(values: Vec<FieldValue>) -> Self {
        Self {
            fields: values.into_iter().map(Some).collect(),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&FieldValue> {
        self.fields.get(idx).and_then(|f| f.as_ref())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rough wire size, used for query response caps.
    pub fn estimate_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|f| match f {
                Some(FieldValue::String(s)) => s.len() + 8,
                Some(_) => 8,
                None => 1,
            })
            .sum()
    }
}

/// A versioned schema. Multiple versions of one name may coexist; rows carry
/// the version they were encoded against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldDef>,
    pub partition_key_fields: Vec<usize>,
    pub range_key_fields: Vec<usize>,
}

impl Schema {
    /// Structural validation applied when a schema is pushed to a partition.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("schema name is empty".into());
        }
        if self.fields.is_empty() {
            return Err("schema has no fields".into());
        }
        if self.partition_key_fields.is_empty() {
            return Err("schema has no partition key fields".into());
        }
        for &idx in self
            .partition_key_fields
            .iter()
            .chain(self.range_key_fields.iter())
        {
            let field = self
                .fields
                .get(idx)
                .ok_or_else(|| format!("key field index {idx} out of range"))?;
            if !field.field_type.is_keyable() {
                return Err(format!("field '{}' cannot be a key field", field.name));
            }
        }
        Ok(())
    }

    /// Index of the field matching both name and type, or None.
    pub fn find_field(&self, name: &str, field_type: FieldType) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name && f.field_type == field_type)
    }

    /// Index of the field with the given name regardless of type.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn key_of(&self, row: &SerializedRow, field_indexes: &[usize]) -> Option<String> {
        let mut out = String::new();
        for &idx in field_indexes {
            out.push_str(&row.get(idx)?.to_key_string()?);
        }
        Some(out)
    }

    /// Encode the partition key from a full row; None if a key field is unset.
    pub fn partition_key_of(&self, row: &SerializedRow) -> Option<String> {
        self.key_of(row, &self.partition_key_fields)
    }

    /// Encode the range key from a full row; None if a key field is unset.
    pub fn range_key_of(&self, row: &SerializedRow) -> Option<String> {
        self.key_of(row, &self.range_key_fields)
    }
}
