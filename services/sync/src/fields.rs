//! Declarative mapping between remote project fields and local columns.
//!
//! Each remote field carries a kind that knows how to decode the incoming
//! JSON value into a storable scalar and how to encode it back. Zoned
//! timestamps arrive as naive local time in the remote system's zone and are
//! stored normalized to UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::CET;
use serde_json::Value;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Boolean,
    Integer,
    /// 64-bit integer transported as a string to survive JSON number limits.
    BigIntText,
    Float,
    /// Decimal transported as a string to avoid float precision loss.
    DecimalText,
    /// Calendar date without a time component.
    Date,
    /// Naive timestamp in the remote system's local zone.
    ZonedDateTime,
}

/// A decoded scalar ready to bind into a storage column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

pub struct FieldMapping {
    pub remote_name: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

const fn field(remote_name: &'static str, column: &'static str, kind: FieldKind) -> FieldMapping {
    FieldMapping {
        remote_name,
        column,
        kind,
    }
}

/// Scalar project fields, in storage column order.
pub static PROJECT_FIELDS: &[FieldMapping] = &[
    field("code", "code", FieldKind::Text),
    field("description", "description", FieldKind::Text),
    field("text", "text", FieldKind::Text),
    field("email", "email", FieldKind::Text),
    field("yourReference", "your_reference", FieldKind::Text),
    field("extIdentifier", "ext_identifier", FieldKind::Text),
    field("extOrder", "ext_order", FieldKind::Text),
    field("contract", "contract", FieldKind::Text),
    field("overview", "overview", FieldKind::Text),
    field("invoiceHeader", "invoice_header", FieldKind::Text),
    field("invoiceFooter", "invoice_footer", FieldKind::Text),
    field("shortInfo", "short_info", FieldKind::Text),
    field("shortInternalInfo", "short_internal_info", FieldKind::Text),
    field("fromDate", "from_date", FieldKind::Date),
    field("toDate", "to_date", FieldKind::Date),
    field("totalRevenue", "total_revenue", FieldKind::DecimalText),
    field("yearlyRevenue", "yearly_revenue", FieldKind::DecimalText),
    field("contractedRevenue", "contracted_revenue", FieldKind::DecimalText),
    field("totalCost", "total_cost", FieldKind::DecimalText),
    field("yearlyCost", "yearly_cost", FieldKind::DecimalText),
    field("pctCompleted", "pct_completed", FieldKind::Float),
    field("totalEstimateHours", "total_estimate_hours", FieldKind::Float),
    field("yearlyEstimateHours", "yearly_estimate_hours", FieldKind::Float),
    field("budgetCoveragePercent", "budget_coverage_percent", FieldKind::Float),
    field("external", "external", FieldKind::Boolean),
    field("billable", "billable", FieldKind::Boolean),
    field("fixedClient", "fixed_client", FieldKind::Boolean),
    field("allowPosting", "allow_posting", FieldKind::Boolean),
    field("timesheetEntry", "timesheet_entry", FieldKind::Boolean),
    field("accessControl", "access_control", FieldKind::Boolean),
    field("assignment", "assignment", FieldKind::Boolean),
    field("activity", "activity", FieldKind::Boolean),
    field("expenseLedger", "expense_ledger", FieldKind::Boolean),
    field("fundProject", "fund_project", FieldKind::Boolean),
    field("createdAt", "created_at", FieldKind::ZonedDateTime),
    field("modifiedAt", "modified_at", FieldKind::ZonedDateTime),
    field("progressDate", "progress_date", FieldKind::ZonedDateTime),
];

impl FieldKind {
    /// Decode a remote JSON value. `Ok(None)` means a null to store as-is;
    /// a wrongly-typed or unparseable value is an error, never a silent null.
    pub fn decode(&self, value: &Value) -> Result<Option<FieldValue>, String> {
        if value.is_null() {
            return Ok(None);
        }
        let decoded = match self {
            FieldKind::Text => FieldValue::Text(
                value
                    .as_str()
                    .ok_or_else(|| type_mismatch("string", value))?
                    .to_string(),
            ),
            FieldKind::Boolean => FieldValue::Integer(i64::from(
                value.as_bool().ok_or_else(|| type_mismatch("bool", value))?,
            )),
            FieldKind::Integer => FieldValue::Integer(
                value.as_i64().ok_or_else(|| type_mismatch("integer", value))?,
            ),
            FieldKind::BigIntText => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| type_mismatch("integer string", value))?;
                FieldValue::Integer(
                    raw.parse::<i64>()
                        .map_err(|e| format!("bad integer {raw:?}: {e}"))?,
                )
            }
            FieldKind::Float => FieldValue::Real(
                value.as_f64().ok_or_else(|| type_mismatch("number", value))?,
            ),
            FieldKind::DecimalText => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| type_mismatch("decimal string", value))?;
                raw.parse::<f64>()
                    .map_err(|e| format!("bad decimal {raw:?}: {e}"))?;
                FieldValue::Text(raw.to_string())
            }
            FieldKind::Date => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| type_mismatch("date string", value))?;
                NaiveDate::parse_from_str(raw, DATE_FORMAT)
                    .map_err(|e| format!("bad date {raw:?}: {e}"))?;
                FieldValue::Text(raw.to_string())
            }
            FieldKind::ZonedDateTime => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| type_mismatch("datetime string", value))?;
                FieldValue::Text(local_to_utc(raw)?.to_rfc3339())
            }
        };
        Ok(Some(decoded))
    }

    /// Encode a stored scalar back into the remote JSON shape. The inverse of
    /// [`FieldKind::decode`]; a value from the wrong storage type is an error.
    pub fn encode(&self, value: &FieldValue) -> Result<Value, String> {
        match (self, value) {
            (FieldKind::Text, FieldValue::Text(text)) => Ok(Value::String(text.clone())),
            (FieldKind::Boolean, FieldValue::Integer(n)) => match n {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(format!("stored boolean out of range: {other}")),
            },
            (FieldKind::Integer, FieldValue::Integer(n)) => Ok(Value::from(*n)),
            (FieldKind::BigIntText, FieldValue::Integer(n)) => Ok(Value::String(n.to_string())),
            (FieldKind::Float, FieldValue::Real(x)) => serde_json::Number::from_f64(*x)
                .map(Value::Number)
                .ok_or_else(|| format!("non-finite float {x} is not representable")),
            (FieldKind::DecimalText, FieldValue::Text(raw))
            | (FieldKind::Date, FieldValue::Text(raw)) => Ok(Value::String(raw.clone())),
            (FieldKind::ZonedDateTime, FieldValue::Text(raw)) => {
                let utc = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| format!("bad stored datetime {raw:?}: {e}"))?
                    .with_timezone(&Utc);
                Ok(Value::String(utc_to_local_string(utc)))
            }
            (kind, value) => Err(format!("cannot encode {value:?} as {kind:?}")),
        }
    }
}

/// Interpret a naive timestamp as remote-zone local time and normalize to
/// UTC. Timestamps erased by a DST spring-forward gap are rejected.
fn local_to_utc(raw: &str) -> Result<DateTime<Utc>, String> {
    let naive = NaiveDateTime::parse_from_str(raw, LOCAL_DATETIME_FORMAT)
        .map_err(|e| format!("bad datetime {raw:?}: {e}"))?;
    CET.from_local_datetime(&naive)
        .earliest()
        .map(|zoned| zoned.with_timezone(&Utc))
        .ok_or_else(|| format!("datetime {raw:?} does not exist in the remote zone"))
}

/// Render a UTC instant in the remote system's local zone, the form its
/// timestamp fields and filters carry.
pub fn utc_to_local_string(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&CET)
        .format(LOCAL_DATETIME_FORMAT)
        .to_string()
}

fn type_mismatch(expected: &str, value: &Value) -> String {
    format!("expected {expected}, got {value}")
}
