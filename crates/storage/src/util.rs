//! Row-mapping helpers shared by every table module. `rusqlite` stores
//! timestamps as RFC3339 text and UUIDs as text; these helpers keep that
//! conversion in one place instead of repeating it per query.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use uuid::Uuid;

use crate::error::{map_rusqlite, Result};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| d.to_rfc3339())
}

pub fn get_uuid(row: &Row, idx: &str) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn get_opt_uuid(row: &Row, idx: &str) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

pub fn get_dt(row: &Row, idx: &str) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub fn get_opt_dt(row: &Row, idx: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

pub fn get_json(row: &Row, idx: &str) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn get_tags(row: &Row, idx: &str) -> rusqlite::Result<Vec<String>> {
    let v = get_json(row, idx)?;
    Ok(serde_json::from_value(v).unwrap_or_default())
}

pub fn get_embedding(row: &Row, idx: &str) -> rusqlite::Result<Vec<f32>> {
    let blob: Option<Vec<u8>> = row.get(idx)?;
    Ok(match blob {
        Some(bytes) => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        None => Vec::new(),
    })
}

pub fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

pub fn parse_enum<T: std::str::FromStr>(row: &Row, idx: &str) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.to_string().into()))
}

pub fn parse_opt_enum<T: std::str::FromStr>(row: &Row, idx: &str) -> rusqlite::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.to_string().into())),
        None => Ok(None),
    }
}

pub fn json_text<T: serde::Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).map_err(|e| sa_domain::error::Error::Json(e))
}

pub(crate) fn ok<T>(r: rusqlite::Result<T>) -> Result<T> {
    r.map_err(map_rusqlite)
}
