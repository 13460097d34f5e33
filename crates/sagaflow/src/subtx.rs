//! Sub-transaction definitions and the typed→erased call boundary.
//!
//! User operations are ordinary async functions over typed arguments. They are
//! stored erased: `(SagaContext, Vec<AnyArg>) -> future`, so one registry can
//! hold sub-transactions of any shape and the saga can replay compensations
//! from decoded log params without knowing their types.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::SagaContext;
use crate::error::ConfigError;
use crate::params::{AnyArg, SagaArgs};

/// Erased operation: both faces of a sub-transaction are stored in this shape.
pub type ErasedOp = Arc<
    dyn Fn(SagaContext, Vec<AnyArg>) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// A registered sub-transaction: forward action, compensating action, and the
/// param type names both faces share.
///
/// Both closures were built from one typed argument tuple, so "compensation
/// accepts exactly what the action received" holds by construction.
#[derive(Clone)]
pub struct SubTxDef {
    pub(crate) sub_tx_id: String,
    pub(crate) action: ErasedOp,
    pub(crate) compensate: ErasedOp,
    pub(crate) param_names: Vec<&'static str>,
}

impl SubTxDef {
    /// Identifier this definition is registered under.
    pub fn sub_tx_id(&self) -> &str {
        &self.sub_tx_id
    }

    /// Registered type names of the argument tuple, in positional order.
    pub fn param_names(&self) -> &[&'static str] {
        &self.param_names
    }
}

impl std::fmt::Debug for SubTxDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTxDef")
            .field("sub_tx_id", &self.sub_tx_id)
            .field("param_names", &self.param_names)
            .finish()
    }
}

/// An async function usable as a sub-transaction face over the argument
/// tuple `A`.
///
/// Implemented for `Fn(SagaContext, T1, …, Tn) -> Future<Output = Result<(),
/// E>>` where `(T1, …, Tn)` is `A` and `E` converts into [`anyhow::Error`].
pub trait SubTxFn<A: SagaArgs>: Send + Sync + Sized + 'static {
    /// Erase into the registry's dynamic call shape.
    fn erase(self) -> ErasedOp;
}

macro_rules! impl_sub_tx_fn {
    ($($ty:ident),*) => {
        impl<F, Fut, E, $($ty,)*> SubTxFn<($($ty,)*)> for F
        where
            F: Fn(SagaContext, $($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Result<(), E>> + Send + 'static,
            E: Into<anyhow::Error> + 'static,
            $($ty: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,)*
        {
            #[allow(non_snake_case)]
            fn erase(self) -> ErasedOp {
                Arc::new(move |ctx, args| {
                    let f = self.clone();
                    let decoded = <($($ty,)*) as SagaArgs>::from_args(args);
                    Box::pin(async move {
                        let ($($ty,)*) = match decoded {
                            Ok(tuple) => tuple,
                            Err(err) => panic!("sub-transaction argument mismatch: {err}"),
                        };
                        f(ctx, $($ty,)*).await.map_err(Into::into)
                    })
                })
            }
        }
    };
}

impl_sub_tx_fn!();
impl_sub_tx_fn!(T1);
impl_sub_tx_fn!(T1, T2);
impl_sub_tx_fn!(T1, T2, T3);
impl_sub_tx_fn!(T1, T2, T3, T4);
impl_sub_tx_fn!(T1, T2, T3, T4, T5);

/// Mapping from sub-transaction id to its definition.
#[derive(Default)]
pub struct SubTxRegistry {
    defs: HashMap<String, SubTxDef>,
}

impl SubTxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; re-registering an id is rejected.
    pub fn add_definition(&mut self, def: SubTxDef) -> Result<(), ConfigError> {
        if self.defs.contains_key(&def.sub_tx_id) {
            return Err(ConfigError::DuplicateSubTx(def.sub_tx_id));
        }
        self.defs.insert(def.sub_tx_id.clone(), def);
        Ok(())
    }

    pub fn find(&self, sub_tx_id: &str) -> Option<&SubTxDef> {
        self.defs.get(sub_tx_id)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
