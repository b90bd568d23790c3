//! The type registry: maps Postgres type OIDs to decoder capabilities.
//!
//! Builtins cover the common scalar types and their arrays. Enumerations
//! and composite types are resolved lazily: when an unknown OID shows up
//! (discovery, a `TYPE` logical message, or a relation column) the registry
//! fetches the `pg_type` row over the shared query connection and registers
//! an appropriate decoder. Nested composites recurse; arrays of composites
//! are explicitly unsupported and decode to nothing.

mod value;

pub use value::PgValue;

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use fallible_iterator::FallibleIterator;
use postgres_protocol::types as wire;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Encoding of a tuple cell on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Text,
    Binary,
}

/// Decoder selection for one type OID.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Bool,
    Bytea,
    Char,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Interval,
    Json,
    Jsonb,
    Inet,
    /// User-defined enum; labels travel as text in both wire formats.
    Enum,
    /// Array with the given element type.
    Array { element: u32 },
    /// User-defined composite; field order matches `pg_attribute.attnum`.
    Composite { fields: Vec<(String, u32)> },
    /// Registered placeholder for types we can not decode (composite
    /// arrays). Values are omitted.
    Unsupported,
}

/// A registered type.
#[derive(Debug, Clone)]
pub struct DataType {
    pub oid: u32,
    pub name: String,
    pub kind: Kind,
}

/// OID -> decoder registry.
pub struct TypeRegistry {
    types: HashMap<u32, DataType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// 2000-01-01, the epoch of binary date/timestamp values.
fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

impl TypeRegistry {
    /// A registry pre-populated with the builtin scalar types and their
    /// arrays.
    pub fn with_builtins() -> Self {
        let mut reg = Self {
            types: HashMap::new(),
        };
        let builtins: &[(u32, &str, Kind)] = &[
            (16, "bool", Kind::Bool),
            (17, "bytea", Kind::Bytea),
            (18, "char", Kind::Char),
            (19, "name", Kind::Text),
            (20, "int8", Kind::Int8),
            (21, "int2", Kind::Int2),
            (23, "int4", Kind::Int4),
            (25, "text", Kind::Text),
            (26, "oid", Kind::Oid),
            (114, "json", Kind::Json),
            (650, "cidr", Kind::Inet),
            (700, "float4", Kind::Float4),
            (701, "float8", Kind::Float8),
            (869, "inet", Kind::Inet),
            (1042, "bpchar", Kind::Text),
            (1043, "varchar", Kind::Text),
            (1082, "date", Kind::Date),
            (1083, "time", Kind::Time),
            (1114, "timestamp", Kind::Timestamp),
            (1184, "timestamptz", Kind::Timestamptz),
            (1186, "interval", Kind::Interval),
            (1700, "numeric", Kind::Numeric),
            (2950, "uuid", Kind::Uuid),
            (3802, "jsonb", Kind::Jsonb),
            // arrays
            (199, "_json", Kind::Array { element: 114 }),
            (1000, "_bool", Kind::Array { element: 16 }),
            (1001, "_bytea", Kind::Array { element: 17 }),
            (1005, "_int2", Kind::Array { element: 21 }),
            (1007, "_int4", Kind::Array { element: 23 }),
            (1009, "_text", Kind::Array { element: 25 }),
            (1014, "_bpchar", Kind::Array { element: 1042 }),
            (1015, "_varchar", Kind::Array { element: 1043 }),
            (1016, "_int8", Kind::Array { element: 20 }),
            (1021, "_float4", Kind::Array { element: 700 }),
            (1022, "_float8", Kind::Array { element: 701 }),
            (1028, "_oid", Kind::Array { element: 26 }),
            (1115, "_timestamp", Kind::Array { element: 1114 }),
            (1182, "_date", Kind::Array { element: 1082 }),
            (1183, "_time", Kind::Array { element: 1083 }),
            (1185, "_timestamptz", Kind::Array { element: 1184 }),
            (1187, "_interval", Kind::Array { element: 1186 }),
            (1231, "_numeric", Kind::Array { element: 1700 }),
            (2951, "_uuid", Kind::Array { element: 2950 }),
            (3807, "_jsonb", Kind::Array { element: 3802 }),
        ];
        for (oid, name, kind) in builtins {
            reg.register(*oid, name, kind.clone());
        }
        reg
    }

    pub fn register(&mut self, oid: u32, name: &str, kind: Kind) {
        self.types.insert(
            oid,
            DataType {
                oid,
                name: name.to_string(),
                kind,
            },
        );
    }

    pub fn contains(&self, oid: u32) -> bool {
        self.types.contains_key(&oid)
    }

    /// Looks an OID up. Zero OIDs and OIDs missing after a discovery
    /// attempt are errors; `resolve` itself never triggers discovery.
    pub fn resolve(&self, oid: u32) -> Result<&DataType> {
        if oid == 0 {
            return Err(Error::ZeroTypeOid);
        }
        self.types.get(&oid).ok_or(Error::TypeNotFound(oid))
    }

    /// Fetches an unknown type from the catalog and registers a decoder.
    ///
    /// Idempotent; recurses for composite attributes and array elements.
    /// Must run on the query connection, never the replication one.
    pub async fn discover(&mut self, client: &tokio_postgres::Client, oid: u32) -> Result<()> {
        if oid == 0 {
            return Err(Error::ZeroTypeOid);
        }
        if self.types.contains_key(&oid) {
            return Ok(());
        }

        let row = client
            .query_opt(
                "SELECT t.typname::text, t.typtype::\"char\", t.typcategory::\"char\", \
                        t.typarray::oid, t.typelem::oid, t.typrelid::oid \
                 FROM pg_catalog.pg_type t WHERE t.oid = $1",
                &[&oid],
            )
            .await?
            .ok_or(Error::TypeNotFound(oid))?;

        let name: String = row.get(0);
        let typtype: i8 = row.get(1);
        let typcategory: i8 = row.get(2);
        let array_oid: u32 = row.get(3);
        let elem_oid: u32 = row.get(4);
        let rel_oid: u32 = row.get(5);

        match typtype as u8 {
            b'c' => {
                let attrs = client
                    .query(
                        "SELECT a.attname::text, a.atttypid::oid \
                         FROM pg_catalog.pg_attribute a \
                         WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped \
                         ORDER BY a.attnum",
                        &[&rel_oid],
                    )
                    .await?;

                let mut fields = Vec::with_capacity(attrs.len());
                for attr in &attrs {
                    let field_name: String = attr.get(0);
                    let field_oid: u32 = attr.get(1);
                    // nested enums and composites need their own decoders
                    Box::pin(self.discover(client, field_oid)).await?;
                    fields.push((field_name, field_oid));
                }
                self.register(oid, &name, Kind::Composite { fields });
                info!(oid, name = %name, "registered composite type");

                if array_oid > 0 {
                    self.register(array_oid, &format!("_{}", name), Kind::Unsupported);
                    warn!(oid = array_oid, name = %name, "array composites are not yet supported");
                }
                Ok(())
            }
            b'e' => {
                self.register(oid, &name, Kind::Enum);
                info!(oid, name = %name, "registered enum type");
                if array_oid > 0 {
                    self.register(array_oid, &format!("_{}", name), Kind::Array { element: oid });
                    info!(oid = array_oid, name = %name, "registered enum array");
                }
                Ok(())
            }
            b'b' => {
                if typcategory as u8 == b'A' && elem_oid > 0 {
                    Box::pin(self.discover(client, elem_oid)).await?;
                    self.register(oid, &name, Kind::Array { element: elem_oid });
                    return Ok(());
                }
                Err(Error::UnknownType(name))
            }
            _ => Err(Error::UnknownType(name)),
        }
    }

    /// Decodes a raw cell into a value.
    pub fn decode(&self, oid: u32, raw: &[u8], format: WireFormat) -> Result<PgValue> {
        let dt = self.resolve(oid)?;
        match format {
            WireFormat::Binary => self.decode_binary(dt, raw),
            WireFormat::Text => self.decode_text(dt, raw),
        }
    }

    fn decode_binary(&self, dt: &DataType, raw: &[u8]) -> Result<PgValue> {
        let err = |e: Box<dyn std::error::Error + Sync + Send>| {
            Error::value(format!("{} ({}): {}", dt.name, dt.oid, e))
        };
        Ok(match &dt.kind {
            Kind::Bool => PgValue::Bool(wire::bool_from_sql(raw).map_err(err)?),
            Kind::Bytea => PgValue::Bytes(wire::bytea_from_sql(raw).to_vec()),
            Kind::Char => PgValue::Int(wire::char_from_sql(raw).map_err(err)? as i64),
            Kind::Int2 => PgValue::Int(wire::int2_from_sql(raw).map_err(err)? as i64),
            Kind::Int4 => PgValue::Int(wire::int4_from_sql(raw).map_err(err)? as i64),
            Kind::Int8 => PgValue::Int(wire::int8_from_sql(raw).map_err(err)?),
            Kind::Oid => PgValue::Int(wire::oid_from_sql(raw).map_err(err)? as i64),
            Kind::Float4 => PgValue::Float(wire::float4_from_sql(raw).map_err(err)? as f64),
            Kind::Float8 => PgValue::Float(wire::float8_from_sql(raw).map_err(err)?),
            Kind::Numeric => PgValue::Numeric(numeric_from_binary(raw)?),
            Kind::Text | Kind::Enum => {
                PgValue::Text(wire::text_from_sql(raw).map_err(err)?.to_string())
            }
            Kind::Uuid => PgValue::Uuid(Uuid::from_bytes(wire::uuid_from_sql(raw).map_err(err)?)),
            Kind::Date => {
                let days = wire::date_from_sql(raw).map_err(err)?;
                pg_epoch_date()
                    .checked_add_signed(chrono::Duration::days(days as i64))
                    .map(PgValue::Date)
                    .ok_or_else(|| Error::value(format!("date out of range: {days}")))?
            }
            Kind::Time => {
                let micros = wire::time_from_sql(raw).map_err(err)?;
                NaiveTime::from_num_seconds_from_midnight_opt(
                    (micros / 1_000_000) as u32,
                    ((micros % 1_000_000) * 1000) as u32,
                )
                .map(PgValue::Time)
                .ok_or_else(|| Error::value(format!("time out of range: {micros}")))?
            }
            Kind::Timestamp => PgValue::Timestamp(timestamp_from_micros(
                wire::timestamp_from_sql(raw).map_err(err)?,
            )?),
            Kind::Timestamptz => {
                let ts = timestamp_from_micros(wire::timestamp_from_sql(raw).map_err(err)?)?;
                PgValue::Timestamptz(Utc.from_utc_datetime(&ts))
            }
            Kind::Interval => PgValue::Text(interval_from_binary(raw)?),
            Kind::Json => PgValue::Json(serde_json::from_slice(raw)?),
            Kind::Jsonb => {
                // jsonb is a one-byte version header followed by json text
                let body = raw
                    .split_first()
                    .filter(|(v, _)| **v == 1)
                    .map(|(_, rest)| rest)
                    .ok_or_else(|| Error::value("unsupported jsonb version"))?;
                PgValue::Json(serde_json::from_slice(body)?)
            }
            Kind::Inet => PgValue::Text(inet_from_binary(raw)?),
            Kind::Array { .. } => {
                let arr = wire::array_from_sql(raw).map_err(err)?;
                let elem_oid = arr.element_type();
                let mut items = Vec::new();
                let mut values = arr.values();
                while let Some(cell) = values.next().map_err(err)? {
                    match cell {
                        None => items.push(PgValue::Null),
                        Some(data) => items.push(self.decode(elem_oid, data, WireFormat::Binary)?),
                    }
                }
                PgValue::Array(items)
            }
            Kind::Composite { fields } => self.composite_from_binary(dt, fields, raw)?,
            Kind::Unsupported => {
                return Err(Error::UnknownType(dt.name.clone()));
            }
        })
    }

    /// Binary record format: i32 field count, then per field the type OID,
    /// an i32 length (-1 for NULL) and the raw bytes.
    fn composite_from_binary(
        &self,
        dt: &DataType,
        fields: &[(String, u32)],
        raw: &[u8],
    ) -> Result<PgValue> {
        let short = || Error::value(format!("composite {}: truncated record", dt.name));
        let mut at = 0usize;

        let nfields =
            i32::from_be_bytes(take(raw, &mut at, 4).ok_or_else(short)?.try_into().unwrap())
                as usize;
        let mut out = Vec::with_capacity(nfields);
        for i in 0..nfields {
            let field_oid =
                u32::from_be_bytes(take(raw, &mut at, 4).ok_or_else(short)?.try_into().unwrap());
            let len =
                i32::from_be_bytes(take(raw, &mut at, 4).ok_or_else(short)?.try_into().unwrap());
            let name = fields
                .get(i)
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| format!("f{}", i + 1));
            if len < 0 {
                out.push((name, PgValue::Null));
                continue;
            }
            let data = take(raw, &mut at, len as usize).ok_or_else(short)?;
            out.push((name, self.decode(field_oid, data, WireFormat::Binary)?));
        }
        Ok(PgValue::Composite(out))
    }

    /// Text-format decoding. Unparseable input degrades to a plain string;
    /// the consumer does not get a typed upgrade for it, which is safe.
    fn decode_text(&self, dt: &DataType, raw: &[u8]) -> Result<PgValue> {
        let s = String::from_utf8_lossy(raw).into_owned();
        Ok(match &dt.kind {
            Kind::Bool => match s.as_str() {
                "t" | "true" | "TRUE" => PgValue::Bool(true),
                "f" | "false" | "FALSE" => PgValue::Bool(false),
                _ => PgValue::Text(s),
            },
            Kind::Char | Kind::Int2 | Kind::Int4 | Kind::Int8 | Kind::Oid => {
                s.parse::<i64>().map(PgValue::Int).unwrap_or(PgValue::Text(s))
            }
            Kind::Float4 | Kind::Float8 => s
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(PgValue::Float)
                .unwrap_or(PgValue::Text(s)),
            Kind::Numeric => PgValue::Numeric(s),
            Kind::Text | Kind::Enum | Kind::Interval | Kind::Inet => PgValue::Text(s),
            Kind::Bytea => s
                .strip_prefix("\\x")
                .and_then(|h| hex::decode(h).ok())
                .map(PgValue::Bytes)
                .unwrap_or(PgValue::Text(s)),
            Kind::Uuid => Uuid::parse_str(&s).map(PgValue::Uuid).unwrap_or(PgValue::Text(s)),
            Kind::Date => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(PgValue::Date)
                .unwrap_or(PgValue::Text(s)),
            Kind::Time => NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                .map(PgValue::Time)
                .unwrap_or(PgValue::Text(s)),
            Kind::Timestamp => NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map(PgValue::Timestamp)
                .unwrap_or(PgValue::Text(s)),
            Kind::Timestamptz => chrono::DateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|ts| PgValue::Timestamptz(ts.with_timezone(&Utc)))
                .unwrap_or(PgValue::Text(s)),
            Kind::Json | Kind::Jsonb => serde_json::from_str(&s)
                .map(PgValue::Json)
                .unwrap_or(PgValue::Text(s)),
            Kind::Array { element } => self.array_from_text(*element, &s)?,
            Kind::Composite { fields } => self.composite_from_text(fields, &s)?,
            Kind::Unsupported => return Err(Error::UnknownType(dt.name.clone())),
        })
    }

    /// Parses the `{a,"b,c",NULL}` array text form. Nested braces recurse
    /// into sub-arrays (multidimensional input).
    fn array_from_text(&self, element: u32, s: &str) -> Result<PgValue> {
        // skip an optional dimension prefix like `[1:3]=`
        let open = s
            .find('{')
            .ok_or_else(|| Error::value(format!("malformed array literal: {s}")))?;
        let mut chars = s[open..].chars().peekable();
        self.array_items(element, &mut chars)
    }

    fn array_items(
        &self,
        element: u32,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) -> Result<PgValue> {
        let malformed = || Error::value("malformed array literal");
        if chars.next() != Some('{') {
            return Err(malformed());
        }
        let mut items = Vec::new();
        if chars.peek() == Some(&'}') {
            chars.next();
            return Ok(PgValue::Array(items));
        }
        loop {
            match chars.peek() {
                Some('{') => items.push(self.array_items(element, chars)?),
                Some('"') => {
                    chars.next();
                    let mut value = String::new();
                    loop {
                        match chars.next().ok_or_else(malformed)? {
                            '"' => break,
                            '\\' => value.push(chars.next().ok_or_else(malformed)?),
                            c => value.push(c),
                        }
                    }
                    items.push(self.decode(element, value.as_bytes(), WireFormat::Text)?);
                }
                Some(_) => {
                    let mut token = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == ',' || c == '}' {
                            break;
                        }
                        token.push(c);
                        chars.next();
                    }
                    if token == "NULL" {
                        items.push(PgValue::Null);
                    } else {
                        items.push(self.decode(element, token.as_bytes(), WireFormat::Text)?);
                    }
                }
                None => return Err(malformed()),
            }
            match chars.next() {
                Some(',') => continue,
                Some('}') => return Ok(PgValue::Array(items)),
                _ => return Err(malformed()),
            }
        }
    }

    /// Parses the `(v1,"v 2",)` record text form.
    fn composite_from_text(&self, fields: &[(String, u32)], s: &str) -> Result<PgValue> {
        let malformed = || Error::value(format!("malformed record literal: {s}"));
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(malformed)?;

        let mut out = Vec::new();
        let mut chars = inner.chars().peekable();
        let mut idx = 0usize;
        loop {
            let (name, oid) = fields
                .get(idx)
                .map(|(n, o)| (n.clone(), *o))
                .unwrap_or_else(|| (format!("f{}", idx + 1), 25));

            if chars.peek() == Some(&'"') {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next().ok_or_else(malformed)? {
                        '"' => {
                            // doubled quote is an escaped quote
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                value.push('"');
                            } else {
                                break;
                            }
                        }
                        '\\' => value.push(chars.next().ok_or_else(malformed)?),
                        c => value.push(c),
                    }
                }
                out.push((name, self.decode(oid, value.as_bytes(), WireFormat::Text)?));
            } else {
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                if token.is_empty() {
                    out.push((name, PgValue::Null));
                } else {
                    out.push((name, self.decode(oid, token.as_bytes(), WireFormat::Text)?));
                }
            }
            idx += 1;
            match chars.next() {
                Some(',') => continue,
                None => return Ok(PgValue::Composite(out)),
                _ => return Err(malformed()),
            }
        }
    }
}

/// Advances a cursor over a raw buffer, `None` when it runs short.
fn take<'a>(raw: &'a [u8], at: &mut usize, n: usize) -> Option<&'a [u8]> {
    if raw.len() < *at + n {
        return None;
    }
    let slice = &raw[*at..*at + n];
    *at += n;
    Some(slice)
}

/// Converts binary timestamp micros (epoch 2000-01-01) into a datetime.
fn timestamp_from_micros(micros: i64) -> Result<NaiveDateTime> {
    pg_epoch_date()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .checked_add_signed(chrono::Duration::microseconds(micros))
        .ok_or_else(|| Error::value(format!("timestamp out of range: {micros}")))
}

/// Decodes the numeric wire format into its decimal text form.
///
/// Layout: u16 digit count, i16 weight (in base-10000 units), u16 sign,
/// u16 display scale, then the base-10000 digits.
fn numeric_from_binary(raw: &[u8]) -> Result<String> {
    let short = || Error::value("numeric: truncated value");
    if raw.len() < 8 {
        return Err(short());
    }
    let ndigits = u16::from_be_bytes(raw[0..2].try_into().unwrap()) as usize;
    let weight = i16::from_be_bytes(raw[2..4].try_into().unwrap()) as i32;
    let sign = u16::from_be_bytes(raw[4..6].try_into().unwrap());
    let dscale = u16::from_be_bytes(raw[6..8].try_into().unwrap()) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    if raw.len() < 8 + ndigits * 2 {
        return Err(short());
    }
    let digit = |i: i32| -> u16 {
        if i < 0 || i as usize >= ndigits {
            return 0;
        }
        let at = 8 + i as usize * 2;
        u16::from_be_bytes(raw[at..at + 2].try_into().unwrap())
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push_str(&frac);
    }
    Ok(out)
}

/// Decodes the interval wire format (micros, days, months) into the
/// familiar `N mons N days HH:MM:SS` text form.
fn interval_from_binary(raw: &[u8]) -> Result<String> {
    if raw.len() < 16 {
        return Err(Error::value("interval: truncated value"));
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into().unwrap());
    let days = i32::from_be_bytes(raw[8..12].try_into().unwrap());
    let months = i32::from_be_bytes(raw[12..16].try_into().unwrap());

    let mut parts = Vec::new();
    if months != 0 {
        let years = months / 12;
        let mons = months % 12;
        if years != 0 {
            parts.push(format!("{} years", years));
        }
        if mons != 0 {
            parts.push(format!("{} mons", mons));
        }
    }
    if days != 0 {
        parts.push(format!("{} days", days));
    }
    if micros != 0 || parts.is_empty() {
        let neg = micros < 0;
        let abs = micros.unsigned_abs();
        let (h, m, s, us) = (
            abs / 3_600_000_000,
            (abs / 60_000_000) % 60,
            (abs / 1_000_000) % 60,
            abs % 1_000_000,
        );
        let mut time = format!("{}{:02}:{:02}:{:02}", if neg { "-" } else { "" }, h, m, s);
        if us != 0 {
            time.push_str(format!(".{:06}", us).trim_end_matches('0'));
        }
        parts.push(time);
    }
    Ok(parts.join(" "))
}

/// Decodes the inet/cidr wire format into `address[/prefix]` text.
fn inet_from_binary(raw: &[u8]) -> Result<String> {
    let malformed = || Error::value("inet: malformed value");
    if raw.len() < 4 {
        return Err(malformed());
    }
    let (family, bits, _is_cidr, nb) = (raw[0], raw[1], raw[2], raw[3] as usize);
    if raw.len() < 4 + nb {
        return Err(malformed());
    }
    let addr = &raw[4..4 + nb];
    let (text, full) = match (family, nb) {
        (2, 4) => (
            std::net::Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(),
            32,
        ),
        (3, 16) => {
            let octets: [u8; 16] = addr.try_into().unwrap();
            (std::net::Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return Err(malformed()),
    };
    if bits as u32 == full {
        Ok(text)
    } else {
        Ok(format!("{}/{}", text, bits))
    }
}
