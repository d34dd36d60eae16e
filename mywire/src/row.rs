//! Column definitions and rows of result sets
use crate::{
    constants::{column_flag, type_},
    error::{ConnectionResult, WithLoc},
    package_parser::{DecodeError, DecodeResult, PackageParser},
    value::Value,
};

/// Information about a column in a result set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    /// Schema of the table the column is from
    pub schema: String,
    /// Alias of the table the column is from
    pub table: String,
    /// Name of the column in the result
    pub name: String,
    /// Name of the column in the table
    pub org_name: String,
    /// Character set of the column
    pub character_set: u16,
    /// Maximal length of the column
    pub length: u32,
    /// The type of the column, see [crate::constants::type_]
    pub r#type: u8,
    /// Column flags, see [crate::constants::column_flag]
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl Column {
    /// Return true if the column holds unsigned integers
    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flag::UNSIGNED != 0
    }

    /// Return true if the column may not contain `NULL`
    pub fn is_not_null(&self) -> bool {
        self.flags & column_flag::NOT_NULL != 0
    }
}

/// Parse a column definition package
pub(crate) fn parse_column_definition(package: &[u8]) -> ConnectionResult<Column> {
    let mut p = PackageParser::new(package);
    p.skip_lenenc_str().loc("catalog")?;
    let schema = p.get_lenenc_str().loc("schema")?.to_string();
    let table = p.get_lenenc_str().loc("table")?.to_string();
    p.skip_lenenc_str().loc("org_table")?;
    let name = p.get_lenenc_str().loc("name")?.to_string();
    let org_name = p.get_lenenc_str().loc("org_name")?.to_string();
    p.get_lenenc().loc("length of fixed length fields")?;
    let character_set = p.get_u16().loc("character_set")?;
    let length = p.get_u32().loc("column_length")?;
    let r#type = p.get_u8().loc("type")?;
    let flags = p.get_u16().loc("flags")?;
    let decimals = p.get_u8().loc("decimals")?;
    Ok(Column {
        schema,
        table,
        name,
        org_name,
        character_set,
        length,
        r#type,
        flags,
        decimals,
    })
}

/// How the values of a row are encoded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowFormat {
    /// Every value is a length encoded string, rows of `COM_QUERY`
    Text,
    /// Values are encoded by type after a null bitmap, rows of `COM_STMT_EXECUTE`
    Binary,
}

/// A row returned by a Mysql/Mariadb query
#[derive(Clone, Copy)]
pub struct Row<'a> {
    /// Columns in the row
    columns: &'a [Column],
    /// The package containing the row
    package: &'a [u8],
    /// Encoding of the package
    format: RowFormat,
}

impl<'a> Row<'a> {
    /// Construct a new row instance
    pub(crate) fn new(columns: &'a [Column], package: &'a [u8], format: RowFormat) -> Self {
        Self {
            columns,
            package,
            format,
        }
    }

    /// The columns of the row
    pub fn columns(&self) -> &'a [Column] {
        self.columns
    }

    /// Number of values in the row
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Return true if the row has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Encoding of the row
    pub fn format(&self) -> RowFormat {
        self.format
    }

    /// Iterate over the values of the row in column order
    pub fn values(&self) -> RowValues<'a> {
        let mut parser = PackageParser::new(self.package);
        let mut nulls: &[u8] = &[];
        let mut error = None;
        if self.format == RowFormat::Binary {
            // Header byte and a null bitmap with an offset of two bits
            let header = parser
                .get_u8()
                .and_then(|_| parser.get_bytes((self.columns.len() + 7 + 2) / 8));
            match header {
                Ok(v) => nulls = v,
                Err(e) => error = Some(e),
            }
        }
        RowValues {
            columns: self.columns,
            nulls,
            parser,
            format: self.format,
            idx: 0,
            error,
        }
    }

    /// Decode the value of the column at idx
    pub fn get(&self, idx: usize) -> DecodeResult<Value<'a>> {
        let mut values = self.values();
        for _ in 0..idx {
            values.next().ok_or(DecodeError::EndOfColumns)??;
        }
        values.next().ok_or(DecodeError::EndOfColumns)?
    }

    /// Decode the value of the column with the given name
    pub fn get_by_name(&self, name: &str) -> DecodeResult<Value<'a>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or(DecodeError::EndOfColumns)?;
        self.get(idx)
    }

    /// Decode all values of the row
    pub fn to_vec(&self) -> DecodeResult<Vec<Value<'a>>> {
        self.values().collect()
    }
}

impl std::fmt::Debug for Row<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut l = f.debug_list();
        for v in self.values() {
            match v {
                Ok(v) => l.entry(&v),
                Err(e) => l.entry(&e),
            };
        }
        l.finish()
    }
}

/// Iterator over the values of a [Row]
pub struct RowValues<'a> {
    /// List of all the column types
    columns: &'a [Column],
    /// Null bitmap of binary rows
    nulls: &'a [u8],
    /// Parser used to parse the fields
    parser: PackageParser<'a>,
    /// Encoding of the row
    format: RowFormat,
    /// Index of the next column to parse
    idx: usize,
    /// Error found while parsing the row header
    error: Option<DecodeError>,
}

impl<'a> RowValues<'a> {
    /// Decode the next value of a text row
    fn next_text(&mut self) -> DecodeResult<Value<'a>> {
        if self.parser.peek_u8()? == 0xFB {
            self.parser.get_u8()?;
            return Ok(Value::Null);
        }
        Ok(Value::Bytes(self.parser.get_lenenc_blob()?))
    }

    /// Decode the next value of a binary row
    fn next_binary(&mut self, c: &Column) -> DecodeResult<Value<'a>> {
        let bit = self.idx + 2;
        if self.nulls.get(bit / 8).is_some_and(|b| b & (1 << (bit % 8)) != 0) {
            return Ok(Value::Null);
        }
        let p = &mut self.parser;
        let unsigned = c.is_unsigned();
        Ok(match c.r#type {
            type_::NULL => Value::Null,
            type_::TINY if unsigned => Value::UInt(p.get_u8()?.into()),
            type_::TINY => Value::Int(p.get_i8()?.into()),
            type_::SHORT | type_::YEAR if unsigned => Value::UInt(p.get_u16()?.into()),
            type_::SHORT | type_::YEAR => Value::Int(p.get_i16()?.into()),
            type_::LONG | type_::INT24 if unsigned => Value::UInt(p.get_u32()?.into()),
            type_::LONG | type_::INT24 => Value::Int(p.get_i32()?.into()),
            type_::LONG_LONG if unsigned => Value::UInt(p.get_u64()?),
            type_::LONG_LONG => Value::Int(p.get_i64()?),
            type_::FLOAT => Value::Float(p.get_f32()?),
            type_::DOUBLE => Value::Double(p.get_f64()?),
            type_::DATE | type_::DATETIME | type_::TIMESTAMP => {
                let len = p.get_u8()?;
                if !matches!(len, 0 | 4 | 7 | 11) {
                    return Err(DecodeError::InvalidSize(len));
                }
                let (mut year, mut month, mut day) = (0, 0, 0);
                let (mut hour, mut minute, mut second, mut microsecond) = (0, 0, 0, 0);
                if len >= 4 {
                    year = p.get_u16()?;
                    month = p.get_u8()?;
                    day = p.get_u8()?;
                }
                if len >= 7 {
                    hour = p.get_u8()?;
                    minute = p.get_u8()?;
                    second = p.get_u8()?;
                }
                if len == 11 {
                    microsecond = p.get_u32()?;
                }
                Value::Date {
                    year,
                    month,
                    day,
                    hour,
                    minute,
                    second,
                    microsecond,
                }
            }
            type_::TIME => {
                let len = p.get_u8()?;
                if !matches!(len, 0 | 8 | 12) {
                    return Err(DecodeError::InvalidSize(len));
                }
                let (mut negative, mut days, mut hours, mut minutes, mut seconds, mut microsecond) =
                    (false, 0, 0, 0, 0, 0);
                if len >= 8 {
                    negative = p.get_u8()? == 1;
                    days = p.get_u32()?;
                    hours = p.get_u8()?;
                    minutes = p.get_u8()?;
                    seconds = p.get_u8()?;
                }
                if len == 12 {
                    microsecond = p.get_u32()?;
                }
                Value::Time {
                    negative,
                    days,
                    hours,
                    minutes,
                    seconds,
                    microsecond,
                }
            }
            type_::DECIMAL
            | type_::NEW_DECIMAL
            | type_::VAR_CHAR
            | type_::BIT
            | type_::JSON
            | type_::BLOB
            | type_::VAR_STRING
            | type_::STRING
            | type_::ENUM
            | type_::SET
            | type_::TINY_BLOB
            | type_::MEDIUM_BLOB
            | type_::LONG_BLOB
            | type_::GEOMETRY => Value::Bytes(p.get_lenenc_blob()?),
            t => return Err(DecodeError::UnknownType(t)),
        })
    }
}

impl<'a> Iterator for RowValues<'a> {
    type Item = DecodeResult<Value<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.idx = self.columns.len();
            return Some(Err(e));
        }
        let columns = self.columns;
        let c = columns.get(self.idx)?;
        let v = match self.format {
            RowFormat::Text => self.next_text(),
            RowFormat::Binary => self.next_binary(c),
        };
        self.idx = if v.is_ok() { self.idx + 1 } else { columns.len() };
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{Column, Row, RowFormat, parse_column_definition};
    use crate::{constants::{column_flag, type_}, package_writer::PackageWriter, value::Value};

    /// A column of the given type
    fn column(name: &str, r#type: u8, flags: u16) -> Column {
        Column {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            character_set: 63,
            length: 0,
            r#type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn column_definition() {
        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        for s in ["def", "shop", "o", "orders", "total", "total"] {
            w.put_lenenc_bytes(s.as_bytes());
        }
        w.put_lenenc(0x0C);
        w.put_u16(63);
        w.put_u32(20);
        w.put_u8(type_::LONG_LONG);
        w.put_u16(column_flag::UNSIGNED | column_flag::NOT_NULL);
        w.put_u8(0);
        w.put_u16(0);
        let c = parse_column_definition(&buff).unwrap();
        assert_eq!(c.schema, "shop");
        assert_eq!(c.table, "o");
        assert_eq!(c.name, "total");
        assert_eq!(c.length, 20);
        assert!(c.is_unsigned());
        assert!(c.is_not_null());
    }

    #[test]
    fn text_row() {
        let columns = [column("a", type_::VAR_STRING, 0), column("b", type_::LONG, 0)];
        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        w.put_u8(0xFB);
        w.put_lenenc_bytes(b"-42");
        let row = Row::new(&columns, &buff, RowFormat::Text);
        assert_eq!(row.get(0).unwrap(), Value::Null);
        assert_eq!(row.get_by_name("b").unwrap().as_i64(), Some(-42));
        assert!(row.get(2).is_err());
    }

    #[test]
    fn binary_row() {
        let columns = [
            column("id", type_::LONG_LONG, column_flag::UNSIGNED),
            column("missing", type_::VAR_STRING, 0),
            column("name", type_::VAR_STRING, 0),
            column("at", type_::DATETIME, 0),
            column("small", type_::TINY, 0),
        ];
        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        w.put_u8(0);
        // Column 1 is null, the bitmap is offset by two bits
        w.put_u8(1 << 3);
        w.put_u8(0);
        w.put_u64(7);
        w.put_lenenc_bytes(b"bob");
        w.put_u8(7);
        w.put_u16(2024);
        w.put_bytes(&[2, 29, 13, 14, 15]);
        w.put_u8(0xFF);
        let row = Row::new(&columns, &buff, RowFormat::Binary);
        let values = row.to_vec().unwrap();
        assert_eq!(values[0], Value::UInt(7));
        assert_eq!(values[1], Value::Null);
        assert_eq!(values[2].as_str(), Some("bob"));
        assert_eq!(
            values[3],
            Value::Date {
                year: 2024,
                month: 2,
                day: 29,
                hour: 13,
                minute: 14,
                second: 15,
                microsecond: 0
            }
        );
        assert_eq!(values[4], Value::Int(-1));
    }

    #[test]
    fn truncated_binary_row() {
        let columns = [column("id", type_::LONG_LONG, 0)];
        let row = Row::new(&columns, &[0, 0, 1, 2], RowFormat::Binary);
        assert!(row.get(0).is_err());
    }
}
