//! Param type registry and tagged-value encoding.
//!
//! Saga arguments outlive the process that produced them: an action's
//! arguments are serialized into the saga log and may be decoded for
//! compensation after a restart. The registry maps a stable type name to an
//! encoder/decoder pair so a `(name, value)` tag written in one process
//! lifetime can be turned back into a typed value in another.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ConfigError;

/// A type-erased argument crossing the registry boundary.
pub type AnyArg = Box<dyn Any + Send>;

/// One serialized argument as it appears in an `actionEnd` log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedParam {
    /// Registered type name, stable across process restarts.
    pub name: String,
    /// JSON encoding of the value.
    pub value: Value,
}

/// Errors from encoding or decoding tagged params.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("param type '{name}' has never been registered")]
    UnknownType { name: String },

    #[error("failed to encode param '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode param '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("param count mismatch: expected {expected}, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("param '{name}' carried an unexpected runtime type")]
    TypeMismatch { name: String },
}

enum EncodeFailure {
    WrongType,
    Json(serde_json::Error),
}

struct ParamCodec {
    type_id: TypeId,
    encode: fn(&(dyn Any + Send)) -> Result<Value, EncodeFailure>,
    decode: fn(Value) -> Result<AnyArg, serde_json::Error>,
}

fn encode_erased<T: Serialize + 'static>(value: &(dyn Any + Send)) -> Result<Value, EncodeFailure> {
    match value.downcast_ref::<T>() {
        Some(value) => serde_json::to_value(value).map_err(EncodeFailure::Json),
        None => Err(EncodeFailure::WrongType),
    }
}

fn decode_erased<T: DeserializeOwned + Send + 'static>(
    value: Value,
) -> Result<AnyArg, serde_json::Error> {
    serde_json::from_value::<T>(value).map(|value| Box::new(value) as AnyArg)
}

/// Bidirectional mapping between stable type names and codecs.
///
/// Populated from sub-transaction registrations; read on every `exec_sub`
/// (encode) and every compensation (decode).
#[derive(Default)]
pub struct ParamRegistry {
    by_name: HashMap<&'static str, ParamCodec>,
    by_type: HashMap<TypeId, &'static str>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its fully-qualified type name.
    ///
    /// Idempotent for the same type. Two distinct types mapping to the same
    /// name (possible across compilation units with identically named types)
    /// are rejected; the name↔type relation must stay a bijection for log
    /// replay to be unambiguous.
    pub fn register<T>(&mut self) -> Result<(), ConfigError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = type_name::<T>();
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_name.get(name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(ConfigError::ParamNameCollision { name });
        }
        self.by_name.insert(
            name,
            ParamCodec {
                type_id,
                encode: encode_erased::<T>,
                decode: decode_erased::<T>,
            },
        );
        self.by_type.insert(type_id, name);
        Ok(())
    }

    /// Whether `name` has a registered codec.
    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// The registered name for a runtime type, if any.
    pub fn name_of(&self, type_id: TypeId) -> Option<&'static str> {
        self.by_type.get(&type_id).copied()
    }

    /// Encode `args` positionally under the given registered `names`.
    pub fn encode(
        &self,
        names: &[&'static str],
        args: &[AnyArg],
    ) -> Result<Vec<TaggedParam>, ParamError> {
        if names.len() != args.len() {
            return Err(ParamError::Arity {
                expected: names.len(),
                actual: args.len(),
            });
        }
        names
            .iter()
            .zip(args)
            .map(|(name, arg)| self.encode_one(name, arg.as_ref()))
            .collect()
    }

    fn encode_one(&self, name: &str, value: &(dyn Any + Send)) -> Result<TaggedParam, ParamError> {
        let codec = self.by_name.get(name).ok_or_else(|| ParamError::UnknownType {
            name: name.to_string(),
        })?;
        match (codec.encode)(value) {
            Ok(value) => Ok(TaggedParam {
                name: name.to_string(),
                value,
            }),
            Err(EncodeFailure::WrongType) => Err(ParamError::TypeMismatch {
                name: name.to_string(),
            }),
            Err(EncodeFailure::Json(source)) => Err(ParamError::Encode {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Decode tagged params back into typed values.
    ///
    /// Fails with [`ParamError::UnknownType`] when a tag names a type the
    /// current process never registered.
    pub fn decode(&self, params: &[TaggedParam]) -> Result<Vec<AnyArg>, ParamError> {
        params
            .iter()
            .map(|param| {
                let codec =
                    self.by_name
                        .get(param.name.as_str())
                        .ok_or_else(|| ParamError::UnknownType {
                            name: param.name.clone(),
                        })?;
                (codec.decode)(param.value.clone()).map_err(|source| ParamError::Decode {
                    name: param.name.clone(),
                    source,
                })
            })
            .collect()
    }
}

fn take_arg<T: Send + 'static>(arg: AnyArg) -> Result<T, ParamError> {
    arg.downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| ParamError::TypeMismatch {
            name: type_name::<T>().to_string(),
        })
}

/// An argument tuple accepted by a sub-transaction's action and compensation.
///
/// Implemented for tuples of up to five serializable elements. The unit tuple
/// `()` is a zero-argument sub-transaction; single arguments are written as
/// one-element tuples, `("acct-a".to_string(),)`.
pub trait SagaArgs: Sized + Send + 'static {
    /// Stable names of every argument type, in positional order.
    fn param_names() -> Vec<&'static str>;

    /// Register a codec for every argument type.
    fn register(registry: &mut ParamRegistry) -> Result<(), ConfigError>;

    /// Erase into boxed values for the dynamic call boundary.
    fn into_args(self) -> Vec<AnyArg>;

    /// Rebuild the tuple from erased values.
    fn from_args(args: Vec<AnyArg>) -> Result<Self, ParamError>;
}

macro_rules! impl_saga_args {
    ($count:expr $(, $ty:ident)*) => {
        impl<$($ty,)*> SagaArgs for ($($ty,)*)
        where
            $($ty: Serialize + DeserializeOwned + Send + 'static,)*
        {
            fn param_names() -> Vec<&'static str> {
                vec![$(type_name::<$ty>(),)*]
            }

            fn register(registry: &mut ParamRegistry) -> Result<(), ConfigError> {
                $(registry.register::<$ty>()?;)*
                let _ = registry;
                Ok(())
            }

            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<AnyArg> {
                let ($($ty,)*) = self;
                vec![$(Box::new($ty) as AnyArg,)*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn from_args(args: Vec<AnyArg>) -> Result<Self, ParamError> {
                if args.len() != $count {
                    return Err(ParamError::Arity {
                        expected: $count,
                        actual: args.len(),
                    });
                }
                let mut args = args.into_iter();
                $(let $ty = take_arg::<$ty>(args.next().expect("length checked above"))?;)*
                Ok(($($ty,)*))
            }
        }
    };
}

impl_saga_args!(0);
impl_saga_args!(1, T1);
impl_saga_args!(2, T1, T2);
impl_saga_args!(3, T1, T2, T3);
impl_saga_args!(4, T1, T2, T3, T4);
impl_saga_args!(5, T1, T2, T3, T4, T5);
