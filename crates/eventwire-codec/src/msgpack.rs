//! MessagePack codec using `rmp-serde`.
//!
//! Values are written through `to_vec_named`, so any map keeps its string
//! keys on the wire. Byte strings use the native `bin` family.

use std::io::Cursor;

use serde::Deserialize;

use crate::error::{CodecError, Result};
use crate::value::Value;
use crate::Codec;

const NAME: &str = "msgpack";

/// Compact binary codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(values).map_err(|err| CodecError::encode(NAME, err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        let mut cursor = Cursor::new(bytes);
        let values = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            Vec::<Value>::deserialize(&mut de)
                .map_err(|err| CodecError::decode(NAME, err.to_string()))?
        };
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(CodecError::decode(
                NAME,
                format!("{} trailing bytes after payload", bytes.len() - consumed),
            ));
        }
        Ok(values)
    }
}
