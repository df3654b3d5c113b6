//! Typed projections of decoded replies.
//!
//! Each result shape is a zero-sized type implementing [`Expectation`]. The
//! type is chosen at the call site, so a request carries a completion slot of
//! exactly the projected type. [`ExpectTag`] is the value-level mirror used
//! where the shape is only known at runtime.

use crate::error::{Error, Result};
use crate::protocol::resp::RespValue;
use bytes::Bytes;
use std::str;

/// Multi-bulk reply tree as handed to callers
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    Nil,
    Status(Bytes),
    Error(String),
    Integer(i64),
    Bytes(Bytes),
    Array(Vec<RedisValue>),
}

impl RedisValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RedisValue::Status(b) | RedisValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RedisValue::Integer(n) => Some(*n),
            RedisValue::Status(b) | RedisValue::Bytes(b) => parse_ascii(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RedisValue]> {
        match self {
            RedisValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<RespValue> for RedisValue {
    fn from(value: RespValue) -> Self {
        match value {
            RespValue::SimpleString(s) => RedisValue::Status(s),
            RespValue::Error(e) => RedisValue::Error(e),
            RespValue::Integer(n) => RedisValue::Integer(n),
            RespValue::BulkString(Some(b)) => RedisValue::Bytes(b),
            RespValue::BulkString(None) | RespValue::Array(None) => RedisValue::Nil,
            RespValue::Array(Some(items)) => {
                RedisValue::Array(items.into_iter().map(RedisValue::from).collect())
            }
        }
    }
}

/// Tagged result value produced by [`ExpectTag::project`]
#[derive(Debug, Clone, PartialEq)]
pub enum TypedResult {
    Void,
    Bool(bool),
    Integer(i64),
    Double(f64),
    NullableInteger(Option<i64>),
    NullableDouble(Option<f64>),
    Bytes(Option<Bytes>),
    String(Option<String>),
    Status(Bytes),
    StatusString(String),
    MultiBytes(Vec<Option<Bytes>>),
    MultiStrings(Vec<Option<String>>),
    Array(Option<Vec<RedisValue>>),
}

/// Runtime name of a result shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectTag {
    Array,
    BulkString,
    BulkStringBytes,
    Double,
    GreaterThanZero,
    Integer,
    MultiDataBytes,
    MultiDataStrings,
    Nothing,
    NullableDouble,
    NullableInteger,
    Ok,
    One,
    SimpleString,
    SimpleStringBytes,
}

impl ExpectTag {
    pub const ALL: [ExpectTag; 15] = [
        ExpectTag::Array,
        ExpectTag::BulkString,
        ExpectTag::BulkStringBytes,
        ExpectTag::Double,
        ExpectTag::GreaterThanZero,
        ExpectTag::Integer,
        ExpectTag::MultiDataBytes,
        ExpectTag::MultiDataStrings,
        ExpectTag::Nothing,
        ExpectTag::NullableDouble,
        ExpectTag::NullableInteger,
        ExpectTag::Ok,
        ExpectTag::One,
        ExpectTag::SimpleString,
        ExpectTag::SimpleStringBytes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExpectTag::Array => "Array",
            ExpectTag::BulkString => "BulkString",
            ExpectTag::BulkStringBytes => "BulkStringBytes",
            ExpectTag::Double => "Double",
            ExpectTag::GreaterThanZero => "GreaterThanZero",
            ExpectTag::Integer => "Integer",
            ExpectTag::MultiDataBytes => "MultiDataBytes",
            ExpectTag::MultiDataStrings => "MultiDataStrings",
            ExpectTag::Nothing => "Nothing",
            ExpectTag::NullableDouble => "NullableDouble",
            ExpectTag::NullableInteger => "NullableInteger",
            ExpectTag::Ok => "OK",
            ExpectTag::One => "One",
            ExpectTag::SimpleString => "SimpleString",
            ExpectTag::SimpleStringBytes => "SimpleStringBytes",
        }
    }

    /// Look a shape up by name, ignoring ASCII case
    pub fn from_name(name: &str) -> Result<ExpectTag> {
        ExpectTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::NotSupported(format!("expectation '{}'", name)))
    }

    /// Project `value` into the shape named by this tag
    pub fn project(self, value: RespValue, throw_on_error: bool) -> Result<TypedResult> {
        fn run<E: Expectation>(value: RespValue, throw_on_error: bool) -> Result<TypedResult> {
            E::project(value, throw_on_error).map(E::into_typed)
        }

        match self {
            ExpectTag::Array => run::<ExpectArray>(value, throw_on_error),
            ExpectTag::BulkString => run::<ExpectBulkString>(value, throw_on_error),
            ExpectTag::BulkStringBytes => run::<ExpectBulkStringBytes>(value, throw_on_error),
            ExpectTag::Double => run::<ExpectDouble>(value, throw_on_error),
            ExpectTag::GreaterThanZero => run::<ExpectGreaterThanZero>(value, throw_on_error),
            ExpectTag::Integer => run::<ExpectInteger>(value, throw_on_error),
            ExpectTag::MultiDataBytes => run::<ExpectMultiDataBytes>(value, throw_on_error),
            ExpectTag::MultiDataStrings => run::<ExpectMultiDataStrings>(value, throw_on_error),
            ExpectTag::Nothing => run::<ExpectNothing>(value, throw_on_error),
            ExpectTag::NullableDouble => run::<ExpectNullableDouble>(value, throw_on_error),
            ExpectTag::NullableInteger => run::<ExpectNullableInteger>(value, throw_on_error),
            ExpectTag::Ok => run::<ExpectOk>(value, throw_on_error),
            ExpectTag::One => run::<ExpectOne>(value, throw_on_error),
            ExpectTag::SimpleString => run::<ExpectSimpleString>(value, throw_on_error),
            ExpectTag::SimpleStringBytes => run::<ExpectSimpleStringBytes>(value, throw_on_error),
        }
    }

    /// Like [`project`](Self::project), where `None` stands for a command
    /// sent without reading its reply
    pub fn project_reply(self, reply: Option<RespValue>, throw_on_error: bool) -> Result<TypedResult> {
        match reply {
            Some(value) => self.project(value, throw_on_error),
            None => self.project_unread(),
        }
    }

    fn project_unread(self) -> Result<TypedResult> {
        fn unread<E: Expectation>() -> Result<TypedResult> {
            Ok(E::into_typed(E::Output::default()))
        }

        match self {
            ExpectTag::Array => unread::<ExpectArray>(),
            ExpectTag::BulkString => unread::<ExpectBulkString>(),
            ExpectTag::BulkStringBytes => unread::<ExpectBulkStringBytes>(),
            ExpectTag::Double => unread::<ExpectDouble>(),
            ExpectTag::GreaterThanZero => unread::<ExpectGreaterThanZero>(),
            ExpectTag::Integer => unread::<ExpectInteger>(),
            ExpectTag::MultiDataBytes => unread::<ExpectMultiDataBytes>(),
            ExpectTag::MultiDataStrings => unread::<ExpectMultiDataStrings>(),
            ExpectTag::Nothing => unread::<ExpectNothing>(),
            ExpectTag::NullableDouble => unread::<ExpectNullableDouble>(),
            ExpectTag::NullableInteger => unread::<ExpectNullableInteger>(),
            ExpectTag::Ok => unread::<ExpectOk>(),
            ExpectTag::One => unread::<ExpectOne>(),
            ExpectTag::SimpleString => unread::<ExpectSimpleString>(),
            ExpectTag::SimpleStringBytes => unread::<ExpectSimpleStringBytes>(),
        }
    }
}

/// A result shape. `convert` states the strict contract; `project` adds the
/// error-reply and `throw_on_error` handling shared by every shape.
pub trait Expectation: Send + Sync + 'static {
    type Output: Default + Send + 'static;

    const TAG: ExpectTag;

    fn convert(value: RespValue) -> Result<Self::Output>;

    fn into_typed(output: Self::Output) -> TypedResult;

    fn project(value: RespValue, throw_on_error: bool) -> Result<Self::Output> {
        let result = match value {
            RespValue::Error(message) => Err(Error::Server(message)),
            value => Self::convert(value),
        };
        match result {
            Err(_) if !throw_on_error => Ok(Self::Output::default()),
            other => other,
        }
    }

    /// Fire-and-forget commands never read a reply, so they settle with
    /// the shape's default
    fn project_reply(reply: Option<RespValue>, throw_on_error: bool) -> Result<Self::Output> {
        match reply {
            Some(value) => Self::project(value, throw_on_error),
            None => Ok(Self::Output::default()),
        }
    }
}

fn unexpected<T>(tag: ExpectTag, value: &RespValue) -> Result<T> {
    Err(Error::corrupt(format!(
        "expected {} reply, got {}",
        tag.name(),
        value.kind()
    )))
}

fn parse_ascii<T: str::FromStr>(data: &[u8]) -> Option<T> {
    str::from_utf8(data).ok()?.trim().parse().ok()
}

fn lossy(data: Bytes) -> String {
    match String::from_utf8(data.to_vec()) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Numeric payload of a scalar frame, `None` for nil
fn numeric<T: str::FromStr>(tag: ExpectTag, value: RespValue) -> Result<Option<T>> {
    let bytes = match value {
        RespValue::Integer(n) => {
            let mut buf = itoa::Buffer::new();
            return parse_ascii(buf.format(n).as_bytes())
                .map(Some)
                .ok_or_else(|| Error::corrupt(format!("integer {} out of range", n)));
        }
        RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => s,
        RespValue::BulkString(None) | RespValue::Array(None) => return Ok(None),
        other => return unexpected(tag, &other),
    };
    parse_ascii(&bytes).map(Some).ok_or_else(|| {
        Error::corrupt(format!(
            "{} reply '{}' is not numeric",
            tag.name(),
            String::from_utf8_lossy(&bytes)
        ))
    })
}

fn multi_data(tag: ExpectTag, value: RespValue) -> Result<Vec<Option<Bytes>>> {
    match value {
        RespValue::SimpleString(s) => Ok(vec![Some(s)]),
        RespValue::BulkString(b) => Ok(vec![b]),
        RespValue::Integer(n) => {
            let mut buf = itoa::Buffer::new();
            Ok(vec![Some(Bytes::copy_from_slice(buf.format(n).as_bytes()))])
        }
        RespValue::Array(None) => Ok(Vec::new()),
        RespValue::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                RespValue::SimpleString(s) => Ok(Some(s)),
                RespValue::BulkString(b) => Ok(b),
                RespValue::Integer(n) => {
                    let mut buf = itoa::Buffer::new();
                    Ok(Some(Bytes::copy_from_slice(buf.format(n).as_bytes())))
                }
                RespValue::Error(message) => Err(Error::Server(message)),
                nested => unexpected(tag, &nested),
            })
            .collect(),
        other => unexpected(tag, &other),
    }
}

macro_rules! expectation {
    ($(#[$meta:meta])* $name:ident, $tag:ident, $out:ty, $typed:expr, |$value:ident| $body:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Expectation for $name {
            type Output = $out;

            const TAG: ExpectTag = ExpectTag::$tag;

            fn convert($value: RespValue) -> Result<Self::Output> {
                $body
            }

            fn into_typed(output: Self::Output) -> TypedResult {
                ($typed)(output)
            }
        }
    };
}

expectation!(
    /// Multi-bulk reply; nil array projects to `None`
    ExpectArray, Array, Option<Vec<RedisValue>>, TypedResult::Array,
    |value| match value {
        RespValue::Array(None) => Ok(None),
        RespValue::Array(Some(items)) => {
            Ok(Some(items.into_iter().map(RedisValue::from).collect()))
        }
        other => unexpected(ExpectTag::Array, &other),
    }
);

expectation!(
    /// Bulk or status text; nil projects to `None`
    ExpectBulkString, BulkString, Option<String>, TypedResult::String,
    |value| match value {
        RespValue::BulkString(b) => Ok(b.map(lossy)),
        RespValue::SimpleString(s) => Ok(Some(lossy(s))),
        other => unexpected(ExpectTag::BulkString, &other),
    }
);

expectation!(
    ExpectBulkStringBytes, BulkStringBytes, Option<Bytes>, TypedResult::Bytes,
    |value| match value {
        RespValue::BulkString(b) => Ok(b),
        RespValue::SimpleString(s) => Ok(Some(s)),
        other => unexpected(ExpectTag::BulkStringBytes, &other),
    }
);

expectation!(
    ExpectDouble, Double, f64, TypedResult::Double,
    |value| numeric::<f64>(ExpectTag::Double, value)?
        .ok_or_else(|| Error::corrupt("expected Double reply, got nil"))
);

expectation!(
    /// Integer reply greater than zero, e.g. DEL or SADD counts
    ExpectGreaterThanZero, GreaterThanZero, bool, TypedResult::Bool,
    |value| match value {
        RespValue::Integer(n) => Ok(n > 0),
        other => unexpected(ExpectTag::GreaterThanZero, &other),
    }
);

expectation!(
    ExpectInteger, Integer, i64, TypedResult::Integer,
    |value| numeric::<i64>(ExpectTag::Integer, value)?
        .ok_or_else(|| Error::corrupt("expected Integer reply, got nil"))
);

expectation!(
    /// A scalar becomes a one-element result; arrays must be flat
    ExpectMultiDataBytes, MultiDataBytes, Vec<Option<Bytes>>, TypedResult::MultiBytes,
    |value| multi_data(ExpectTag::MultiDataBytes, value)
);

expectation!(
    ExpectMultiDataStrings, MultiDataStrings, Vec<Option<String>>, TypedResult::MultiStrings,
    |value| Ok(multi_data(ExpectTag::MultiDataStrings, value)?
        .into_iter()
        .map(|item| item.map(lossy))
        .collect())
);

expectation!(
    /// Any non-error reply
    ExpectNothing, Nothing, (), |_| TypedResult::Void,
    |value| {
        let _ = value;
        Ok(())
    }
);

expectation!(
    ExpectNullableDouble, NullableDouble, Option<f64>, TypedResult::NullableDouble,
    |value| numeric::<f64>(ExpectTag::NullableDouble, value)
);

expectation!(
    ExpectNullableInteger, NullableInteger, Option<i64>, TypedResult::NullableInteger,
    |value| numeric::<i64>(ExpectTag::NullableInteger, value)
);

expectation!(
    /// `+OK`, compared without regard to ASCII case
    ExpectOk, Ok, bool, TypedResult::Bool,
    |value| match value {
        RespValue::SimpleString(s) if s.eq_ignore_ascii_case(b"OK") => Ok(true),
        RespValue::SimpleString(s) => Err(Error::corrupt(format!(
            "expected OK, got '{}'",
            String::from_utf8_lossy(&s)
        ))),
        other => unexpected(ExpectTag::Ok, &other),
    }
);

expectation!(
    /// Integer reply equal to one, e.g. EXPIRE or SETNX
    ExpectOne, One, bool, TypedResult::Bool,
    |value| match value {
        RespValue::Integer(n) => Ok(n == 1),
        other => unexpected(ExpectTag::One, &other),
    }
);

expectation!(
    ExpectSimpleString, SimpleString, String, TypedResult::StatusString,
    |value| match value {
        RespValue::SimpleString(s) => Ok(lossy(s)),
        other => unexpected(ExpectTag::SimpleString, &other),
    }
);

expectation!(
    ExpectSimpleStringBytes, SimpleStringBytes, Bytes, TypedResult::Status,
    |value| match value {
        RespValue::SimpleString(s) => Ok(s),
        other => unexpected(ExpectTag::SimpleStringBytes, &other),
    }
);
