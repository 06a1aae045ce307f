// ABOUTME: MySQL value conversion into driver-neutral SqlValue and text cells
// ABOUTME: Classifies column types as numeric (unquoted) or literal (quoted)

use crate::session::SqlValue;
use mysql_async::consts::ColumnType;
use mysql_async::Value;

/// Whether values of this column type are written without quotes
///
/// Signed, unsigned, float, integral and decimal types qualify. Everything
/// else (strings, blobs, temporal types, BIT, JSON, ...) is quoted.
pub fn is_numeric_column(column_type: ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_FLOAT
            | ColumnType::MYSQL_TYPE_DOUBLE
            | ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_YEAR
    )
}

/// Convert a MySQL Value into a SqlValue
///
/// With the text protocol every non-NULL value arrives as bytes, so the column
/// type decides between `Numeric` and `Bytes`. Binary-protocol values are
/// handled as well:
/// - Integers / floats → `Numeric`
/// - Dates / times → `Bytes` holding the MySQL literal form
/// - NULL → `Null`
///
/// # Examples
///
/// ```
/// # use mysql_async::Value;
/// # use mysql_dumper::mysql::converter::to_sql_value;
/// # use mysql_dumper::session::SqlValue;
/// assert_eq!(to_sql_value(Value::Bytes(b"42".to_vec()), true), SqlValue::Numeric("42".into()));
/// assert_eq!(to_sql_value(Value::Bytes(b"42".to_vec()), false), SqlValue::Bytes(b"42".to_vec()));
/// ```
pub fn to_sql_value(value: Value, numeric: bool) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(bytes) => {
            if numeric {
                SqlValue::Numeric(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                SqlValue::Bytes(bytes)
            }
        }
        Value::Int(i) => SqlValue::Numeric(i.to_string()),
        Value::UInt(u) => SqlValue::Numeric(u.to_string()),
        Value::Float(f) => SqlValue::Numeric(f.to_string()),
        Value::Double(d) => SqlValue::Numeric(d.to_string()),
        Value::Date(year, month, day, hour, minute, second, micro) => SqlValue::Bytes(
            format_datetime(year, month, day, hour, minute, second, micro).into_bytes(),
        ),
        Value::Time(negative, days, hours, minutes, seconds, micro) => SqlValue::Bytes(
            format_time(negative, days, hours, minutes, seconds, micro).into_bytes(),
        ),
    }
}

/// Render a MySQL Value as text for metadata queries (`None` for NULL)
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(year, month, day, hour, minute, second, micro) => Some(format_datetime(
            *year, *month, *day, *hour, *minute, *second, *micro,
        )),
        Value::Time(negative, days, hours, minutes, seconds, micro) => Some(format_time(
            *negative, *days, *hours, *minutes, *seconds, *micro,
        )),
    }
}

fn format_datetime(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micro: u32,
) -> String {
    let mut out = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year, month, day, hour, minute, second
    );
    if micro > 0 {
        out.push_str(&format!(".{:06}", micro));
    }
    out
}

fn format_time(negative: bool, days: u32, hours: u8, minutes: u8, seconds: u8, micro: u32) -> String {
    let sign = if negative { "-" } else { "" };
    let total_hours = u64::from(days) * 24 + u64::from(hours);
    let mut out = format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds);
    if micro > 0 {
        out.push_str(&format!(".{:06}", micro));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_column_types() {
        assert!(is_numeric_column(ColumnType::MYSQL_TYPE_LONG));
        assert!(is_numeric_column(ColumnType::MYSQL_TYPE_NEWDECIMAL));
        assert!(is_numeric_column(ColumnType::MYSQL_TYPE_DOUBLE));
        assert!(!is_numeric_column(ColumnType::MYSQL_TYPE_VAR_STRING));
        assert!(!is_numeric_column(ColumnType::MYSQL_TYPE_BLOB));
        assert!(!is_numeric_column(ColumnType::MYSQL_TYPE_DATETIME));
        assert!(!is_numeric_column(ColumnType::MYSQL_TYPE_BIT));
    }

    #[test]
    fn test_convert_null() {
        assert_eq!(to_sql_value(Value::NULL, true), SqlValue::Null);
        assert_eq!(to_text(&Value::NULL), None);
    }

    #[test]
    fn test_convert_text_protocol_decimal() {
        let value = Value::Bytes(b"123.4500".to_vec());
        assert_eq!(
            to_sql_value(value, true),
            SqlValue::Numeric("123.4500".to_string())
        );
    }

    #[test]
    fn test_convert_binary_protocol_numbers() {
        assert_eq!(
            to_sql_value(Value::Int(-7), false),
            SqlValue::Numeric("-7".to_string())
        );
        assert_eq!(
            to_sql_value(Value::UInt(42), false),
            SqlValue::Numeric("42".to_string())
        );
        assert_eq!(
            to_sql_value(Value::Double(1.5), false),
            SqlValue::Numeric("1.5".to_string())
        );
    }

    #[test]
    fn test_convert_datetime() {
        let value = Value::Date(2024, 1, 15, 10, 30, 45, 123456);
        assert_eq!(
            to_sql_value(value, false),
            SqlValue::Bytes(b"2024-01-15 10:30:45.123456".to_vec())
        );
        let value = Value::Date(2024, 1, 15, 0, 0, 0, 0);
        assert_eq!(to_text(&value).unwrap(), "2024-01-15 00:00:00");
    }

    #[test]
    fn test_convert_time() {
        let value = Value::Time(true, 1, 10, 30, 45, 0);
        assert_eq!(to_text(&value).unwrap(), "-34:30:45");
    }

    #[test]
    fn test_text_of_binary_bytes_is_lossy() {
        let value = Value::Bytes(vec![b'a', 0xFF]);
        assert_eq!(to_text(&value).unwrap(), "a\u{FFFD}");
    }
}
