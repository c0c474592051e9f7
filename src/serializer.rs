//! Pluggable value codec used for method arguments, results and remote error bodies.
//!
//! A [`Serializer`] only converts between a self-describing [`Value`] and text. Typed conversion
//! happens once, through serde, in [`encode`](dyn Serializer::encode) and
//! [`decode`](dyn Serializer::decode); this keeps the trait object safe so a context can hold any
//! codec behind an `Arc<dyn Serializer>`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Indicates a value could not be converted to or from its wire text.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("json codec error")]
    Json(#[from] serde_json::Error),
}

pub trait Serializer: fmt::Debug + Send + Sync + 'static {
    fn serialize(&self, value: &Value) -> Result<String, SerializerError>;

    fn deserialize(&self, text: &str) -> Result<Value, SerializerError>;
}

impl dyn Serializer {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, SerializerError> {
        let value = serde_json::to_value(value)?;
        self.serialize(&value)
    }

    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, SerializerError> {
        let value = self.deserialize(text)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// The default codec: compact JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<String, SerializerError> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, text: &str) -> Result<Value, SerializerError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn default_serializer() -> Arc<dyn Serializer> {
    Arc::new(JsonSerializer)
}

/// Positional call arguments, each encoded to its own wire string.
///
/// Implemented for `()` and for tuples of up to eight [`Serialize`] values, so a call site reads
/// `stub.invoke::<String, _>("Echo", ("hi",))`.
pub trait EncodeArgs {
    fn encode_args(&self, serializer: &dyn Serializer) -> Result<Vec<String>, SerializerError>;
}

impl EncodeArgs for () {
    fn encode_args(&self, _serializer: &dyn Serializer) -> Result<Vec<String>, SerializerError> {
        Ok(Vec::new())
    }
}

macro_rules! impl_encode_args {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> EncodeArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode_args(
                &self,
                serializer: &dyn Serializer,
            ) -> Result<Vec<String>, SerializerError> {
                let ($($name,)+) = self;
                Ok(vec![$(serializer.encode($name)?),+])
            }
        }
    };
}

impl_encode_args!(A);
impl_encode_args!(A, B);
impl_encode_args!(A, B, C);
impl_encode_args!(A, B, C, D);
impl_encode_args!(A, B, C, D, E);
impl_encode_args!(A, B, C, D, E, F);
impl_encode_args!(A, B, C, D, E, F, G);
impl_encode_args!(A, B, C, D, E, F, G, H);
