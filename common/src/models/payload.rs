//! Payload rows and their plain-text rendering.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{FromRow, Row};

/// The one statement this service runs.
pub const PAYLOAD_QUERY: &str = "select tst, value from app.payload";

/// First line of every successful response body.
pub const PAYLOAD_PREAMBLE: &str = "database payload\n";

/// Timestamp layout used on the wire. Fractional seconds appear only when
/// non-zero; the result parses back with `NaiveDateTime::from_str`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The `value` column, whatever numeric or textual type the table uses.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Null,
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Integer(v) => write!(f, "{}", v),
            PayloadValue::Unsigned(v) => write!(f, "{}", v),
            PayloadValue::Float(v) => write!(f, "{}", v),
            PayloadValue::Text(v) => f.write_str(v),
            PayloadValue::Null => f.write_str("NULL"),
        }
    }
}

/// One `(tst, value)` pair from `app.payload`. A NULL `tst` is kept as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadRow {
    pub tst: Option<NaiveDateTime>,
    pub value: PayloadValue,
}

impl PayloadRow {
    pub fn new(tst: NaiveDateTime, value: PayloadValue) -> Self {
        Self {
            tst: Some(tst),
            value,
        }
    }

    /// Renders `when:<tst> value:<value>\n`; a NULL `tst` renders `NULL`.
    pub fn to_line(&self) -> String {
        match self.tst {
            Some(tst) => format!("when:{} value:{}\n", tst.format(TIMESTAMP_FORMAT), self.value),
            None => format!("when:NULL value:{}\n", self.value),
        }
    }
}

impl<'r> FromRow<'r, MySqlRow> for PayloadRow {
    fn from_row(row: &'r MySqlRow) -> Result<Self, sqlx::Error> {
        // DATETIME decodes naive; TIMESTAMP columns come back as UTC.
        let tst = match row.try_get::<Option<NaiveDateTime>, _>(0) {
            Ok(tst) => tst,
            Err(_) => row
                .try_get::<Option<DateTime<Utc>>, _>(0)?
                .map(|tst| tst.naive_utc()),
        };

        Ok(Self {
            tst,
            value: first_decoded(row, VALUE_DECODERS)?,
        })
    }
}

type Decoder<R> = fn(&R) -> Result<PayloadValue, sqlx::Error>;

/// Tried in order against the `value` column. DECIMAL has no typed match
/// without extra sqlx features, so the last decoder reads its text form.
const VALUE_DECODERS: &[Decoder<MySqlRow>] = &[
    |row| Ok(row.try_get::<Option<i64>, _>(1)?.map_or(PayloadValue::Null, PayloadValue::Integer)),
    |row| Ok(row.try_get::<Option<u64>, _>(1)?.map_or(PayloadValue::Null, PayloadValue::Unsigned)),
    |row| Ok(row.try_get::<Option<f64>, _>(1)?.map_or(PayloadValue::Null, PayloadValue::Float)),
    |row| Ok(row.try_get::<Option<String>, _>(1)?.map_or(PayloadValue::Null, PayloadValue::Text)),
    |row| {
        Ok(row
            .try_get_unchecked::<Option<String>, _>(1)?
            .map_or(PayloadValue::Null, PayloadValue::Text))
    },
];

/// First successful decode, or the last decoder's error.
fn first_decoded<R>(row: &R, decoders: &[Decoder<R>]) -> Result<PayloadValue, sqlx::Error> {
    let mut last = sqlx::Error::ColumnNotFound("value".into());
    for decode in decoders {
        match decode(row) {
            Ok(value) => return Ok(value),
            Err(e) => last = e,
        }
    }
    Err(last)
}
