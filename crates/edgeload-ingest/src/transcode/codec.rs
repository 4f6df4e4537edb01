//! Record encodings for the digested artifact
//!
//! The binary layout (`ebin`) is:
//!
//! ```text
//! "EBIN" version:u8 field_count:varint
//!   per field: name:str kind:u8 flags:u8 precision:u8 scale:u8
//! per record: length:varint payload
//!   Text      str                      (varint length + UTF-8)
//!   MultiText count:varint str*
//!   Numeric   present:u8 [zigzag varint of the scaled value]
//!   Date      present:u8 [zigzag varint of epoch millis, UTC]
//! ```
//!
//! Varints are unsigned LEB128; signed values go through zig-zag first.

use crate::schema::field::format_scaled;
use crate::schema::{DatasetSchema, FieldDefinition, FieldKind, FieldValue};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 4] = b"EBIN";
pub const VERSION: u8 = 1;

const FLAG_MULTI_VALUE: u8 = 0b0000_0001;

/// Largest record or header string the reader will allocate for.
pub const MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

pub fn write_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn write_str(s: &str, buf: &mut Vec<u8>) {
    write_varint(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

fn write_optional(value: Option<i64>, buf: &mut Vec<u8>) {
    match value {
        Some(v) => {
            buf.push(1);
            write_varint(zigzag(v), buf);
        },
        None => buf.push(0),
    }
}

fn kind_tag(kind: FieldKind) -> u8 {
    match kind {
        FieldKind::Text => 0,
        FieldKind::Numeric => 1,
        FieldKind::Date => 2,
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Destination for encoded rows.
pub trait RecordSink<W: Write> {
    fn write_record(&mut self, values: &[FieldValue]) -> io::Result<()>;

    /// Flush buffered output and hand back the underlying writer.
    fn finish(self) -> io::Result<W>;
}

/// Writes the `ebin` layout.
pub struct BinaryWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> BinaryWriter<W> {
    /// Write the file header for the output fields of `schema`.
    pub fn new(mut inner: W, schema: &DatasetSchema) -> io::Result<Self> {
        let fields: Vec<&FieldDefinition> = schema.output_fields().collect();
        let mut buf = Vec::with_capacity(64 * fields.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        write_varint(fields.len() as u64, &mut buf);
        for f in fields {
            write_str(f.name(), &mut buf);
            buf.push(kind_tag(f.kind()));
            buf.push(if f.is_multi_value() { FLAG_MULTI_VALUE } else { 0 });
            buf.push(f.precision() as u8);
            buf.push(f.scale() as u8);
        }
        inner.write_all(&buf)?;
        buf.clear();
        Ok(Self { inner, buf })
    }
}

impl<W: Write> RecordSink<W> for BinaryWriter<W> {
    fn write_record(&mut self, values: &[FieldValue]) -> io::Result<()> {
        let mut payload = std::mem::take(&mut self.buf);
        payload.clear();
        for value in values {
            match value {
                FieldValue::Text(s) => write_str(s, &mut payload),
                FieldValue::MultiText(items) => {
                    write_varint(items.len() as u64, &mut payload);
                    for item in items {
                        write_str(item, &mut payload);
                    }
                },
                FieldValue::Numeric(v) | FieldValue::Date(v) => write_optional(*v, &mut payload),
            }
        }

        let mut prefix = Vec::with_capacity(10);
        write_varint(payload.len() as u64, &mut prefix);
        self.inner.write_all(&prefix)?;
        self.inner.write_all(&payload)?;
        self.buf = payload;
        Ok(())
    }

    fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Writes normalized delimited rows: output field names as the header, each
/// value rendered back to text.
pub struct CsvRecordWriter<W: Write> {
    writer: csv::Writer<W>,
    fields: Vec<FieldDefinition>,
}

impl<W: Write> CsvRecordWriter<W> {
    pub fn new(inner: W, schema: &DatasetSchema) -> io::Result<Self> {
        let fields: Vec<FieldDefinition> = schema.output_fields().cloned().collect();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(schema.file_format().delimiter())
            .quote(schema.file_format().quote())
            .from_writer(inner);
        writer
            .write_record(fields.iter().map(FieldDefinition::name))
            .map_err(io::Error::from)?;
        Ok(Self { writer, fields })
    }
}

impl<W: Write> RecordSink<W> for CsvRecordWriter<W> {
    fn write_record(&mut self, values: &[FieldValue]) -> io::Result<()> {
        let cells = self.fields.iter().zip(values).map(|(f, v)| f.render(v));
        self.writer.write_record(cells).map_err(io::Error::from)
    }

    fn finish(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

/// Field description read back from an `ebin` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub multi_value: bool,
    pub precision: u8,
    pub scale: u8,
}

impl FieldDescriptor {
    /// Human-readable rendering of a decoded value. Dates are RFC 3339 in UTC.
    pub fn render(&self, value: &FieldValue) -> String {
        match value {
            FieldValue::Text(s) => s.clone(),
            FieldValue::MultiText(values) => values.join(";"),
            FieldValue::Numeric(Some(v)) => format_scaled(*v, u32::from(self.scale)),
            FieldValue::Date(Some(ms)) => DateTime::<Utc>::from_timestamp_millis(*ms)
                .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_else(|| ms.to_string()),
            FieldValue::Numeric(None) | FieldValue::Date(None) => String::new(),
        }
    }
}

/// Reads `ebin` streams back into typed values.
pub struct RecordReader<R: Read> {
    inner: R,
    fields: Vec<FieldDescriptor>,
    buf: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("not an ebin stream"));
        }
        let mut version = [0u8; 1];
        inner.read_exact(&mut version)?;
        if version[0] != VERSION {
            return Err(invalid(format!("unsupported ebin version {}", version[0])));
        }

        let count = read_varint(&mut inner)?.ok_or_else(|| invalid("truncated header"))?;
        let mut fields = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let name = read_stream_str(&mut inner)?;
            let mut attrs = [0u8; 4];
            inner.read_exact(&mut attrs)?;
            let kind = match attrs[0] {
                0 => FieldKind::Text,
                1 => FieldKind::Numeric,
                2 => FieldKind::Date,
                other => return Err(invalid(format!("unknown field kind {other}"))),
            };
            fields.push(FieldDescriptor {
                name,
                kind,
                multi_value: attrs[1] & FLAG_MULTI_VALUE != 0,
                precision: attrs[2],
                scale: attrs[3],
            });
        }

        Ok(Self {
            inner,
            fields,
            buf: Vec::new(),
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> io::Result<Option<Vec<FieldValue>>> {
        let Some(len) = read_varint(&mut self.inner)? else {
            return Ok(None);
        };
        if len > MAX_RECORD_LEN {
            return Err(invalid(format!("record length {len} exceeds {MAX_RECORD_LEN} bytes")));
        }
        self.buf.resize(len as usize, 0);
        self.inner.read_exact(&mut self.buf)?;

        let mut cursor = SliceCursor { data: &self.buf, pos: 0 };
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match (field.kind, field.multi_value) {
                (FieldKind::Text, false) => FieldValue::Text(cursor.str()?),
                (FieldKind::Text, true) => {
                    let count = cursor.varint()?;
                    let items = (0..count).map(|_| cursor.str()).collect::<io::Result<Vec<_>>>()?;
                    FieldValue::MultiText(items)
                },
                (FieldKind::Numeric, _) => FieldValue::Numeric(cursor.optional()?),
                (FieldKind::Date, _) => FieldValue::Date(cursor.optional()?),
            };
            values.push(value);
        }
        if cursor.pos != self.buf.len() {
            return Err(invalid("record has trailing bytes"));
        }
        Ok(Some(values))
    }
}

/// `None` on EOF before the first byte.
fn read_varint<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 if shift == 0 => return Ok(None),
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            _ => {},
        }
        result |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
        if shift >= 64 {
            return Err(invalid("varint overflows 64 bits"));
        }
    }
}

fn read_stream_str<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_varint(reader)?.ok_or_else(|| invalid("truncated string"))?;
    if len > MAX_RECORD_LEN {
        return Err(invalid(format!("string length {len} exceeds {MAX_RECORD_LEN} bytes")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
}

struct SliceCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl SliceCursor<'_> {
    fn byte(&mut self) -> io::Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> io::Result<u64> {
        let mut rest = &self.data[self.pos..];
        let before = rest.len();
        let value = read_varint(&mut rest)?.ok_or_else(|| invalid("truncated record"))?;
        self.pos += before - rest.len();
        Ok(value)
    }

    fn str(&mut self) -> io::Result<String> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| invalid("string runs past the record"))?;
        let s = std::str::from_utf8(&self.data[self.pos..end]).map_err(|e| invalid(e.to_string()))?;
        self.pos = end;
        Ok(s.to_string())
    }

    fn optional(&mut self) -> io::Result<Option<i64>> {
        match self.byte()? {
            0 => Ok(None),
            1 => Ok(Some(unzigzag(self.varint()?))),
            other => Err(invalid(format!("bad presence byte {other}"))),
        }
    }
}
