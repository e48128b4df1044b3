//! Self-describing, line-terminated binary value format used on every
//! connection: commands in, replies and stream frames out.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OK: &str = "OK";
pub const DEFAULT_MAX_BLOB_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Format(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn fmt_err(msg: impl Into<String>) -> Error {
    Error::Format(msg.into())
}

/// A value in the wire protocol. Tagged values are kept out of this enum on
/// purpose: a tag can only appear at the top of a frame, never nested
/// inside an array, table or map, so they're represented by the separate
/// [`Frame`] type instead of being a `Value` variant that every match arm
/// would have to account for.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Str(String),
    Blob(Vec<u8>),
    Error { code: String, message: String },
    Array(Vec<Value>),
    Table { cols: usize, rows: Vec<Vec<Value>> },
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn ok() -> Value {
        Value::Str(OK.to_string())
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Value {
        Value::Error { code: code.into(), message: message.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Str(_) => "string",
            Value::Blob(_) => "blob",
            Value::Error { .. } => "error",
            Value::Array(_) => "array",
            Value::Table { .. } => "table",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Appends one row to a table, setting the column count from the first
    /// row added.
    pub fn table_push_row(cols: &mut usize, rows: &mut Vec<Vec<Value>>, row: Vec<Value>) {
        if rows.is_empty() {
            *cols = row.len();
        }
        rows.push(row);
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.extend_from_slice(b"_\n"),
            Value::Bool(b) => buf.extend_from_slice(if *b { b"#t\n" } else { b"#f\n" }),
            Value::Integer(i) => {
                buf.extend_from_slice(b":");
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'\n');
            }
            Value::Str(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.push(b'\n');
            }
            Value::Blob(data) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.push(b'\n');
                buf.extend_from_slice(data);
                buf.push(b'\n');
            }
            Value::Error { code, message } => {
                buf.push(b'-');
                buf.extend_from_slice(code.as_bytes());
                buf.push(b' ');
                buf.extend_from_slice(message.as_bytes());
                buf.push(b'\n');
            }
            Value::Array(values) => {
                buf.push(b'*');
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.push(b'\n');
                for v in values {
                    v.write_to(buf);
                }
            }
            Value::Table { cols, rows } => {
                buf.push(b'=');
                buf.extend_from_slice(rows.len().to_string().as_bytes());
                buf.push(b',');
                buf.extend_from_slice(cols.to_string().as_bytes());
                buf.push(b'\n');
                for row in rows {
                    for v in row {
                        v.write_to(buf);
                    }
                }
            }
            Value::Map(entries) => {
                buf.push(b'%');
                buf.extend_from_slice(entries.len().to_string().as_bytes());
                buf.push(b'\n');
                for (k, v) in entries {
                    Value::Str(k.clone()).write_to(buf);
                    v.write_to(buf);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }
}

/// A tagged value, used only at the top of a frame to multiplex stream
/// payloads onto the connection alongside command replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub tag: String,
    pub value: Value,
}

impl Tagged {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(b'@');
        buf.extend_from_slice(self.tag.as_bytes());
        buf.push(b'\n');
        self.value.write_to(buf);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }
}

/// Top-level shape read off the wire: either a bare value, or a tagged one.
/// Only the top level can carry a tag; nested reads always pass
/// `allow_tagged = false`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Value(Value),
    Tagged(Tagged),
}

pub struct Reader<R> {
    pub max_blob_len: usize,
    inner: R,
}

impl<R: AsyncBufRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { max_blob_len: DEFAULT_MAX_BLOB_LEN, inner }
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_value(&mut self.inner, self.max_blob_len, true).await
    }

    pub async fn read_value(&mut self) -> Result<Value> {
        match self.read_frame().await? {
            Frame::Value(v) => Ok(v),
            Frame::Tagged(_) => Err(fmt_err("unexpected tag")),
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(line)
}

/// Skips blank lines the way `nextLine` does in the source grammar.
async fn next_nonblank_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    loop {
        let line = read_line(r).await?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
}

async fn read_size<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<usize> {
    let line = next_nonblank_line(r).await?;
    std::str::from_utf8(&line)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| fmt_err(format!("invalid size: {}", String::from_utf8_lossy(&line))))
}

async fn read_integer<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<i64> {
    let line = next_nonblank_line(r).await?;
    std::str::from_utf8(&line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| fmt_err(format!("invalid integer: {}", String::from_utf8_lossy(&line))))
}

async fn read_table_size<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<(usize, usize)> {
    let line = next_nonblank_line(r).await?;
    let text = String::from_utf8_lossy(&line);
    let (rows, cols) = text
        .split_once(',')
        .ok_or_else(|| fmt_err(format!("invalid table size: {text}")))?;
    let rows: usize = rows
        .parse()
        .map_err(|_| fmt_err(format!("invalid table size: {text}")))?;
    let cols: usize = cols
        .parse()
        .map_err(|_| fmt_err(format!("invalid table size: {text}")))?;
    Ok((rows, cols))
}

fn read_value<'a, R: AsyncBufRead + Unpin>(
    r: &'a mut R,
    max_blob_len: usize,
    allow_tagged: bool,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Frame>> + Send + 'a>> {
    Box::pin(async move {
        let mut tag_byte = [0u8; 1];
        r.read_exact(&mut tag_byte).await?;

        let value = match tag_byte[0] {
            b'_' => {
                expect_newline(r).await?;
                Value::Null
            }
            b'#' => {
                let mut sym = [0u8; 1];
                r.read_exact(&mut sym).await?;
                let b = match sym[0] {
                    b't' => true,
                    b'f' => false,
                    c => return Err(fmt_err(format!("unexpected symbol {}, expecting t or f", c as char))),
                };
                expect_newline(r).await?;
                Value::Bool(b)
            }
            b'+' => {
                let line = read_line(r).await?;
                Value::Str(String::from_utf8(line).map_err(|e| fmt_err(e.to_string()))?)
            }
            b'-' => {
                let line = read_line(r).await?;
                let text = String::from_utf8(line).map_err(|e| fmt_err(e.to_string()))?;
                let (code, message) = text
                    .split_once(' ')
                    .ok_or_else(|| fmt_err("error should have at least one space"))?;
                Value::Error { code: code.to_string(), message: message.to_string() }
            }
            b'@' => {
                if !allow_tagged {
                    return Err(fmt_err("unexpected tag"));
                }
                let tag_line = read_line(r).await?;
                let tag = String::from_utf8(tag_line).map_err(|e| fmt_err(e.to_string()))?;
                let inner = read_value(r, max_blob_len, false).await?;
                let value = match inner {
                    Frame::Value(v) => v,
                    Frame::Tagged(_) => unreachable!("nested read never allows tags"),
                };
                return Ok(Frame::Tagged(Tagged { tag, value }));
            }
            b'=' => {
                let (rows, cols) = read_table_size(r).await?;
                let mut data = Vec::with_capacity(rows);
                for _ in 0..rows {
                    let mut row = Vec::with_capacity(cols);
                    for _ in 0..cols {
                        row.push(read_bare_value(r, max_blob_len).await?);
                    }
                    data.push(row);
                }
                Value::Table { cols, rows: data }
            }
            b'*' => {
                let size = read_size(r).await?;
                let mut values = Vec::with_capacity(size);
                for _ in 0..size {
                    values.push(read_bare_value(r, max_blob_len).await?);
                }
                Value::Array(values)
            }
            b'$' => {
                let size = read_size(r).await?;
                if size > max_blob_len {
                    return Err(fmt_err(format!("blobs cannot exceed {max_blob_len} in length")));
                }
                let mut data = vec![0u8; size];
                r.read_exact(&mut data).await?;
                expect_newline(r).await?;
                Value::Blob(data)
            }
            b':' => {
                let n = read_integer(r).await?;
                Value::Integer(n)
            }
            c => return Err(fmt_err(format!("unexpected symbol {}", c as char))),
        };

        Ok(Frame::Value(value))
    })
}

async fn expect_newline<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<()> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).await?;
    if b[0] != b'\n' {
        return Err(fmt_err(format!("unexpected symbol {}, expecting new line", b[0] as char)));
    }
    Ok(())
}

async fn read_bare_value<R: AsyncBufRead + Unpin>(r: &mut R, max_blob_len: usize) -> Result<Value> {
    match read_value(r, max_blob_len, false).await? {
        Frame::Value(v) => Ok(v),
        Frame::Tagged(_) => unreachable!("nested read never allows tags"),
    }
}

pub async fn write_value<W: AsyncWrite + Unpin>(w: &mut W, value: &Value) -> Result<()> {
    let buf = value.to_bytes();
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn write_tagged<W: AsyncWrite + Unpin>(w: &mut W, tagged: &Tagged) -> Result<()> {
    let buf = tagged.to_bytes();
    w.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn roundtrip(v: Value) -> Value {
        let bytes = v.to_bytes();
        let mut reader = Reader::new(BufReader::new(Cursor::new(bytes)));
        reader.read_value().await.unwrap()
    }

    #[tokio::test]
    async fn roundtrips_scalars() {
        assert_eq!(roundtrip(Value::Null).await, Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)).await, Value::Bool(true));
        assert_eq!(roundtrip(Value::Integer(-42)).await, Value::Integer(-42));
        assert_eq!(roundtrip(Value::Str("hello".into())).await, Value::Str("hello".into()));
        assert_eq!(roundtrip(Value::Blob(vec![1, 2, 3])).await, Value::Blob(vec![1, 2, 3]));
        assert_eq!(
            roundtrip(Value::error("ARG", "bad thing")).await,
            Value::Error { code: "ARG".into(), message: "bad thing".into() }
        );
    }

    #[tokio::test]
    async fn roundtrips_array_and_table() {
        let arr = Value::Array(vec![Value::Integer(1), Value::Str("x".into())]);
        assert_eq!(roundtrip(arr.clone()).await, arr);

        let table = Value::Table {
            cols: 2,
            rows: vec![
                vec![Value::Str("a".into()), Value::Integer(1)],
                vec![Value::Str("b".into()), Value::Integer(2)],
            ],
        };
        assert_eq!(roundtrip(table.clone()).await, table);
    }

    #[tokio::test]
    async fn reads_tagged_frame() {
        let tagged = Tagged { tag: "3".into(), value: Value::Blob(vec![9, 9]) };
        let bytes = tagged.to_bytes();
        let mut reader = Reader::new(BufReader::new(Cursor::new(bytes)));
        match reader.read_frame().await.unwrap() {
            Frame::Tagged(t) => assert_eq!(t, tagged),
            Frame::Value(_) => panic!("expected tagged frame"),
        }
    }

    #[tokio::test]
    async fn rejects_nested_tag() {
        let bytes = b"*1\n@1\n+x\n".to_vec();
        let mut reader = Reader::new(BufReader::new(Cursor::new(bytes)));
        assert!(reader.read_value().await.is_err());
    }

    #[tokio::test]
    async fn rejects_blob_over_limit() {
        let mut reader = Reader::new(BufReader::new(Cursor::new(b"$10\n0123456789\n".to_vec())));
        reader.max_blob_len = 4;
        assert!(reader.read_value().await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_symbol() {
        let mut reader = Reader::new(BufReader::new(Cursor::new(b"?\n".to_vec())));
        assert!(reader.read_value().await.is_err());
    }
}
