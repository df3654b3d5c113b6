/// Request model
pub mod command;

/// Typed reply projections
pub mod expect;

/// RESP framing
pub mod resp;

pub use command::{Command, Role, SendType};
pub use expect::{
    ExpectArray, ExpectBulkString, ExpectBulkStringBytes, ExpectDouble, ExpectGreaterThanZero,
    ExpectInteger, ExpectMultiDataBytes, ExpectMultiDataStrings, ExpectNothing,
    ExpectNullableDouble, ExpectNullableInteger, ExpectOk, ExpectOne, ExpectSimpleString,
    ExpectSimpleStringBytes, ExpectTag, Expectation, RedisValue, TypedResult,
};
pub use resp::{RespParser, RespValue};
