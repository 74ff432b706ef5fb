//! Conversion between core values and PostgreSQL types.
//!
//! Parameters are converted against the types the server inferred for the
//! prepared statement, so an [`Value::Int`] bound to an `int4` column is sent
//! as `i32` rather than failing the driver's type check.

use chrono::{DateTime, NaiveDateTime, Utc};
use postgres_types::{ToSql, Type};
use std::sync::Arc;
use tenantry_core::{Row, Value};

use crate::error::{PgError, PgResult};

/// A boxed parameter ready to bind.
pub type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert one value for a parameter of type `ty`.
pub fn to_sql_param(value: &Value, ty: &Type) -> PgResult<SqlParam> {
    let param: SqlParam = match value {
        Value::Null => typed_null(ty),
        Value::Bool(b) => Box::new(*b),
        Value::Int(i) => match *ty {
            Type::INT2 => Box::new(narrow::<i16>(*i, ty)?),
            Type::INT4 => Box::new(narrow::<i32>(*i, ty)?),
            Type::OID => Box::new(narrow::<u32>(*i, ty)?),
            Type::FLOAT4 => Box::new(*i as f32),
            Type::FLOAT8 => Box::new(*i as f64),
            Type::TEXT | Type::VARCHAR => Box::new(i.to_string()),
            _ => Box::new(*i),
        },
        Value::Float(x) => match *ty {
            Type::FLOAT4 => Box::new(*x as f32),
            _ => Box::new(*x),
        },
        Value::Text(s) => Box::new(s.clone()),
        Value::Json(j) => Box::new(j.clone()),
        Value::Uuid(u) => Box::new(*u),
        Value::Timestamp(t) => match *ty {
            Type::TIMESTAMP => Box::new(t.naive_utc()),
            _ => Box::new(*t),
        },
    };

    if !param_accepts(value, ty) {
        return Err(PgError::type_conversion(format!(
            "cannot bind {} value to parameter of type {}",
            value.type_name(),
            ty
        )));
    }
    Ok(param)
}

/// Convert a parameter list against the statement's parameter types.
pub fn to_sql_params(values: &[Value], types: &[Type]) -> PgResult<Vec<SqlParam>> {
    if values.len() != types.len() {
        return Err(PgError::type_conversion(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| to_sql_param(value, ty))
        .collect()
}

fn narrow<T: TryFrom<i64>>(value: i64, ty: &Type) -> PgResult<T> {
    T::try_from(value)
        .map_err(|_| PgError::type_conversion(format!("{} out of range for {}", value, ty)))
}

fn typed_null(ty: &Type) -> SqlParam {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
        Type::UUID => Box::new(None::<uuid::Uuid>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        _ => Box::new(None::<String>),
    }
}

fn param_accepts(value: &Value, ty: &Type) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(_) => <bool as ToSql>::accepts(ty),
        Value::Int(_) => {
            matches!(
                *ty,
                Type::INT2 | Type::INT4 | Type::INT8 | Type::OID | Type::FLOAT4 | Type::FLOAT8
            ) || <String as ToSql>::accepts(ty)
        }
        Value::Float(_) => <f64 as ToSql>::accepts(ty) || <f32 as ToSql>::accepts(ty),
        Value::Text(_) => <String as ToSql>::accepts(ty),
        Value::Json(_) => <serde_json::Value as ToSql>::accepts(ty),
        Value::Uuid(_) => <uuid::Uuid as ToSql>::accepts(ty),
        Value::Timestamp(_) => {
            <DateTime<Utc> as ToSql>::accepts(ty) || <NaiveDateTime as ToSql>::accepts(ty)
        }
    }
}

/// Convert a driver row into a core row.
pub fn from_pg_row(row: &tokio_postgres::Row, columns: &Arc<[String]>) -> PgResult<Row> {
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| column_value(row, idx, column.type_()))
        .collect::<PgResult<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Convert every row of a result set, sharing one column list.
pub fn from_pg_rows(rows: &[tokio_postgres::Row]) -> PgResult<Vec<Row>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[String]> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    rows.iter().map(|row| from_pg_row(row, &columns)).collect()
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> PgResult<Value> {
    fn get<'a, T: postgres_types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
    ) -> PgResult<Option<T>> {
        row.try_get::<_, Option<T>>(idx)
            .map_err(|e| PgError::type_conversion(format!("column {}: {}", idx, e)))
    }

    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::Int),
        Type::OID => get::<u32>(row, idx)?.map(|v| Value::Int(i64::from(v))),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| Value::Float(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(Value::Float),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx)?.map(Value::Text)
        }
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(Value::Uuid),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.map(Value::Timestamp),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(|v| Value::Timestamp(v.and_utc())),
        _ => {
            return Err(PgError::type_conversion(format!(
                "unsupported column type {} at index {}",
                ty, idx
            )));
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
