//! Remote values and remote functions built from engine-code strings.

use std::marker::PhantomData;

use crate::bridge::protocol::Data;
use crate::convert::Converter;
use crate::error::BridgeError;
use crate::handle::Handle;
use crate::session::Session;

/// Phantom shape of a stored engine function from `D` to `R`.
///
/// Never constructed; it only parameterizes handles, so that
/// `Handle<FunOf<D, R>>` can be re-presented as a callable
/// [`MlFunction<D, R>`] without any remote work.
pub struct FunOf<D, R> {
    _marker: PhantomData<fn(D) -> R>,
}

/// A stored engine function, callable from the driver.
///
/// n-ary application reduces to applying to a tuple: an engine function
/// over `(D1, D2)` is an `MlFunction<(D1, D2), R>` and [`call2`] is sugar
/// over the pair converter.
///
/// [`call2`]: MlFunction::call2
pub struct MlFunction<D, R> {
    handle: Handle<FunOf<D, R>>,
}

impl<D, R> Clone for MlFunction<D, R> {
    fn clone(&self) -> Self {
        MlFunction {
            handle: self.handle.clone(),
        }
    }
}

impl<D: Converter, R: Converter> MlFunction<D, R> {
    /// Compile `code` (an engine expression of type `D -> R`) into a stored
    /// function. The code is wrapped between the argument projection and
    /// the result injection, so the stored object is always the
    /// function-from-data-to-data carrier that `Apply` requires.
    pub async fn compile(session: &Session, code: &str) -> Self {
        let body = format!(
            "fn DObject x => DObject (({result}) (({code}) (({argument}) x)))",
            result = R::value_to_exn(),
            argument = D::exn_to_value(),
        );
        let expr = format!(
            "E_Function ({body} | _ => raise Fail \"compiled function: {label}\")",
            label = label::<D, R>(),
        );
        let pending = session.submit_store(expr).await;
        MlFunction {
            handle: Handle::from_pending(session.clone(), pending),
        }
    }

    /// The underlying handle.
    pub fn handle(&self) -> &Handle<FunOf<D, R>> {
        &self.handle
    }

    /// Apply to an already-stored argument. Awaits both ids, issues one
    /// `Apply`, and types the resulting object reference; a reply of any
    /// other shape is a protocol error.
    pub async fn apply(&self, argument: &Handle<D>) -> Result<Handle<R>, BridgeError> {
        let session = self.handle.session().clone();
        let guards = vec![self.handle.guard(), argument.guard()];
        let (function, argument) = tokio::try_join!(self.handle.id(), argument.id())?;
        let pending = session
            .submit_apply(function, Data::Object(argument), guards)
            .await;
        Ok(Handle::from_pending(session, pending))
    }

    /// Store the argument, apply, and retrieve the result.
    pub async fn call(&self, argument: D) -> Result<R, BridgeError> {
        let session = self.handle.session();
        let stored = D::store(session, argument).await?;
        self.apply(&stored).await?.retrieve().await
    }
}

impl<D1, D2, R> MlFunction<(D1, D2), R>
where
    D1: Converter,
    D2: Converter,
    R: Converter,
{
    /// Two-argument application through the pair converter.
    pub async fn call2(&self, first: D1, second: D2) -> Result<R, BridgeError> {
        self.call((first, second)).await
    }
}

impl<D1, D2, D3, R> MlFunction<(D1, D2, D3), R>
where
    D1: Converter,
    D2: Converter,
    D3: Converter,
    R: Converter,
{
    /// Three-argument application through the triple converter.
    pub async fn call3(&self, first: D1, second: D2, third: D3) -> Result<R, BridgeError> {
        self.call((first, second, third)).await
    }
}

impl<D: Converter, R: Converter> Handle<FunOf<D, R>> {
    /// Re-present this handle as a callable function. No remote work; this
    /// is a type reassociation only.
    pub fn function_view(&self) -> MlFunction<D, R> {
        MlFunction {
            handle: self.clone(),
        }
    }
}

fn label<D: Converter, R: Converter>() -> String {
    format!("{} -> {}", D::ml_type(), R::ml_type())
}

impl Session {
    /// Build a stored value by evaluating `code` (an engine expression of
    /// the type described by `A`) and wrapping it into the carrier.
    /// Evaluation happens at store time; an exception raised by `code`
    /// surfaces as an engine error on the handle's id.
    pub async fn compile_value<A: Converter>(&self, code: &str) -> Handle<A> {
        let expr = format!("({}) ({})", A::value_to_exn(), code);
        let pending = self.submit_store(expr).await;
        Handle::from_pending(self.clone(), pending)
    }

    /// Build a stored function from `code`, an engine expression of type
    /// `D -> R`.
    pub async fn compile_function<D: Converter, R: Converter>(
        &self,
        code: &str,
    ) -> MlFunction<D, R> {
        MlFunction::compile(self, code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names_both_types() {
        assert_eq!(label::<i64, String>(), "int -> string");
        assert_eq!(label::<(i64, bool), String>(), "int * bool -> string");
    }
}
