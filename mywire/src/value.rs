//! Values read from rows and parameters bound to prepared statements
use std::fmt::Display;

/// A single value of a [crate::row::Row]
///
/// Text rows yield every non-null value as [Value::Bytes], the accessors
/// parse those on demand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value<'a> {
    /// Sql `NULL`
    Null,
    /// A signed integer
    Int(i64),
    /// An unsigned integer
    UInt(u64),
    /// A single precision float
    Float(f32),
    /// A double precision float
    Double(f64),
    /// Raw bytes of a string, blob or decimal column
    Bytes(&'a [u8]),
    /// A `DATE`, `DATETIME` or `TIMESTAMP` from a binary row
    Date {
        /// Year
        year: u16,
        /// Month 1-12, or 0 for zero dates
        month: u8,
        /// Day of the month
        day: u8,
        /// Hour of the day
        hour: u8,
        /// Minute
        minute: u8,
        /// Second
        second: u8,
        /// Microsecond
        microsecond: u32,
    },
    /// A `TIME` from a binary row
    Time {
        /// True if the time is negative
        negative: bool,
        /// Whole days
        days: u32,
        /// Hours
        hours: u8,
        /// Minutes
        minutes: u8,
        /// Seconds
        seconds: u8,
        /// Microseconds
        microsecond: u32,
    },
}

impl<'a> Value<'a> {
    /// Return true if the value is `NULL`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Return the value as an i64 if it is an integer that fits
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => v.try_into().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Return the value as an u64 if it is a non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => v.try_into().ok(),
            Value::UInt(v) => Some(v),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Return the value as an f64 if it is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            Value::Float(v) => Some(v.into()),
            Value::Double(v) => Some(v),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Return the value as a str if it holds valid utf-8 bytes
    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Return the raw bytes of the value
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl Display for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Date {
                year,
                month,
                day,
                hour,
                minute,
                second,
                microsecond,
            } => {
                write!(
                    f,
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                )?;
                if *microsecond != 0 {
                    write!(f, ".{microsecond:06}")?;
                }
                Ok(())
            }
            Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                microsecond,
            } => {
                let hours = *days * 24 + u32::from(*hours);
                let sign = if *negative { "-" } else { "" };
                write!(f, "{sign}{hours:02}:{minutes:02}:{seconds:02}")?;
                if *microsecond != 0 {
                    write!(f, ".{microsecond:06}")?;
                }
                Ok(())
            }
        }
    }
}

/// A parameter bound to a prepared statement
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Param<'a> {
    /// Sql `NULL`
    Null,
    /// Sent as a signed `BIGINT`
    Int(i64),
    /// Sent as an unsigned `BIGINT`
    UInt(u64),
    /// Sent as a `DOUBLE`
    Double(f64),
    /// Sent as a `BLOB`
    Bytes(&'a [u8]),
    /// Sent as a `VAR_STRING`
    Str(&'a str),
}

/// Implement From for the primitive types converted into one variant
macro_rules! param_from {
    ($variant:ident, $target:ty, $($t:ty),*) => {
        $(
            impl From<$t> for Param<'_> {
                fn from(v: $t) -> Self {
                    Param::$variant(<$target>::from(v))
                }
            }
        )*
    };
}

param_from!(Int, i64, i8, i16, i32, i64);
param_from!(UInt, u64, u8, u16, u32, u64);
param_from!(Double, f64, f32, f64);

impl From<bool> for Param<'_> {
    fn from(v: bool) -> Self {
        Param::Int(v.into())
    }
}

impl<'a> From<&'a str> for Param<'a> {
    fn from(v: &'a str) -> Self {
        Param::Str(v)
    }
}

impl<'a> From<&'a String> for Param<'a> {
    fn from(v: &'a String) -> Self {
        Param::Str(v)
    }
}

impl<'a> From<&'a [u8]> for Param<'a> {
    fn from(v: &'a [u8]) -> Self {
        Param::Bytes(v)
    }
}

impl<'a, T: Into<Param<'a>>> From<Option<T>> for Param<'a> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Param::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Param, Value};

    #[test]
    fn text_values_parse() {
        let v = Value::Bytes(b"18446744073709551615");
        assert_eq!(v.as_u64(), Some(u64::MAX));
        assert_eq!(v.as_i64(), None);
        assert_eq!(Value::Bytes(b"1.5").as_f64(), Some(1.5));
        assert_eq!(Value::Null.as_str(), None);
        assert!(Value::Null.is_null());
    }

    #[test]
    fn display_temporal() {
        let d = Value::Date {
            year: 2024,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
            microsecond: 60,
        };
        assert_eq!(d.to_string(), "2024-01-02 03:04:05.000060");
        let t = Value::Time {
            negative: true,
            days: 1,
            hours: 2,
            minutes: 3,
            seconds: 4,
            microsecond: 0,
        };
        assert_eq!(t.to_string(), "-26:03:04");
    }

    #[test]
    fn params_from() {
        assert_eq!(Param::from(7u8), Param::UInt(7));
        assert_eq!(Param::from(-7i32), Param::Int(-7));
        assert_eq!(Param::from(Option::<&str>::None), Param::Null);
        assert_eq!(Param::from("x"), Param::Str("x"));
    }
}
