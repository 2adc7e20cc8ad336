//! Tuple converters, arity 2 through 7.
//!
//! Engine-side, an n-tuple is a right-leaning nest of the pair carrier:
//! `E_Pair (a, E_Pair (b, ...))`. On the wire it travels disassembled, as a
//! `DList` of `DObject` references, so that the driver can store and
//! retrieve the elements concurrently. The assemble/disassemble engine
//! functions depend only on the arity, never on the element types, so all
//! instantiations of one arity share a single cached compilation.

use async_trait::async_trait;

use super::{Converter, data_fn, element_handle, match_fn};
use crate::bridge::protocol::Data;
use crate::error::BridgeError;
use crate::handle::Handle;
use crate::session::Session;

const VARS: [&str; 7] = ["a", "b", "c", "d", "e", "f", "g"];

/// Right-fold a sequence of exn fragments into nested pair carriers.
fn nest_pairs(parts: &[String]) -> String {
    let mut rev = parts.iter().rev();
    let mut acc = rev.next().cloned().unwrap_or_default();
    for part in rev {
        acc = format!("E_Pair ({part}, {acc})");
    }
    acc
}

/// `fn DList [DObject a, ...] => DObject (E_Pair (a, ...))`, wrapped into
/// the function carrier.
fn assemble_code(label: &str, arity: usize) -> String {
    let pattern = VARS[..arity]
        .iter()
        .map(|var| format!("DObject {var}"))
        .collect::<Vec<_>>()
        .join(", ");
    let exns: Vec<String> = VARS[..arity].iter().map(|var| (*var).to_string()).collect();
    data_fn(
        &format!("{label}.store"),
        &[(
            format!("DList [{pattern}]"),
            format!("DObject ({})", nest_pairs(&exns)),
        )],
    )
}

/// The inverse: `fn DObject (E_Pair (a, ...)) => DList [DObject a, ...]`.
fn disassemble_code(label: &str, arity: usize) -> String {
    let exns: Vec<String> = VARS[..arity].iter().map(|var| (*var).to_string()).collect();
    let items = VARS[..arity]
        .iter()
        .map(|var| format!("DObject {var}"))
        .collect::<Vec<_>>()
        .join(", ");
    data_fn(
        &format!("{label}.retrieve"),
        &[(
            format!("DObject ({})", nest_pairs(&exns)),
            format!("DList [{items}]"),
        )],
    )
}

macro_rules! tuple_converter {
    ($label:literal, $( $T:ident : $idx:tt ),+ ) => {
        #[async_trait]
        impl<$( $T: Converter ),+> Converter for ($( $T, )+) {
            fn ml_type() -> String {
                [$( <$T>::ml_type() ),+].join(" * ")
            }

            fn value_to_exn() -> String {
                let mut names: Vec<&str> = Vec::new();
                let mut wrapped: Vec<String> = Vec::new();
                $(
                    names.push(VARS[$idx]);
                    wrapped.push(format!("({}) {}", <$T>::value_to_exn(), VARS[$idx]));
                )+
                format!("fn ({}) => {}", names.join(", "), nest_pairs(&wrapped))
            }

            fn exn_to_value() -> String {
                let mut bare: Vec<String> = Vec::new();
                let mut projected: Vec<String> = Vec::new();
                $(
                    bare.push(VARS[$idx].to_string());
                    projected.push(format!("({}) {}", <$T>::exn_to_value(), VARS[$idx]));
                )+
                match_fn(
                    concat!($label, ".exn_to_value"),
                    &[(nest_pairs(&bare), format!("({})", projected.join(", ")))],
                )
            }

            async fn store(
                session: &Session,
                value: ($( $T, )+),
            ) -> Result<Handle<($( $T, )+)>, BridgeError> {
                let arity = [$( stringify!($T) ),+].len();
                let handles = tokio::try_join!($( <$T>::store(session, value.$idx) ),+)?;
                let ids = tokio::try_join!($( handles.$idx.id() ),+)?;
                let items = vec![$( Data::Object(ids.$idx) ),+];
                let guards = vec![$( handles.$idx.guard() ),+];
                let function = session.compiled_fn(&assemble_code($label, arity)).await?;
                let pending = session.submit_apply(function, Data::List(items), guards).await;
                Ok(Handle::from_pending(session.clone(), pending))
            }

            async fn retrieve(
                handle: &Handle<($( $T, )+)>,
            ) -> Result<($( $T, )+), BridgeError> {
                let arity = [$( stringify!($T) ),+].len();
                let session = handle.session().clone();
                let function = session.compiled_fn(&disassemble_code($label, arity)).await?;
                let id = handle.id().await?;
                let reply = session
                    .apply_data(function, Data::Object(id), vec![handle.guard()])
                    .await?;
                let items = match reply {
                    Data::List(items) => items,
                    other => {
                        return Err(BridgeError::Convert(format!(
                            "expected disassembled tuple, got {other:?}"
                        )));
                    }
                };
                if items.len() != arity {
                    return Err(BridgeError::Convert(format!(
                        "expected {arity} tuple elements, got {}",
                        items.len()
                    )));
                }
                let mut items = items.into_iter();
                let elements = ($( next_element::<$T>(&session, items.next())?, )+);
                Ok(tokio::try_join!($( <$T>::retrieve(&elements.$idx) ),+)?)
            }
        }
    };
}

fn next_element<A: Converter>(
    session: &Session,
    item: Option<Data>,
) -> Result<Handle<A>, BridgeError> {
    match item {
        Some(data) => element_handle(session, data),
        None => Err(BridgeError::Convert("tuple reply too short".to_string())),
    }
}

tuple_converter!("tuple2", A: 0, B: 1);
tuple_converter!("tuple3", A: 0, B: 1, C: 2);
tuple_converter!("tuple4", A: 0, B: 1, C: 2, D: 3);
tuple_converter!("tuple5", A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_converter!("tuple6", A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_converter!("tuple7", A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_ml_type() {
        assert_eq!(<(i64, String)>::ml_type(), "int * string");
        assert_eq!(<(i64, String, bool)>::ml_type(), "int * string * bool");
    }

    #[test]
    fn pair_shapes_nest_to_the_right() {
        assert_eq!(
            <(i64, i64)>::value_to_exn(),
            "fn (a, b) => E_Pair ((E_Int) a, (E_Int) b)"
        );
        assert_eq!(
            <(i64, i64, i64)>::value_to_exn(),
            "fn (a, b, c) => E_Pair ((E_Int) a, E_Pair ((E_Int) b, (E_Int) c))"
        );
    }

    #[test]
    fn assemble_code_for_pairs() {
        assert_eq!(
            assemble_code("tuple2", 2),
            concat!(
                "E_Function (fn DList [DObject a, DObject b] => DObject (E_Pair (a, b))",
                " | _ => raise Fail \"tuple2.store\")",
            )
        );
    }

    #[test]
    fn disassemble_code_for_triples() {
        assert_eq!(
            disassemble_code("tuple3", 3),
            concat!(
                "E_Function (fn DObject (E_Pair (a, E_Pair (b, c))) => ",
                "DList [DObject a, DObject b, DObject c]",
                " | _ => raise Fail \"tuple3.retrieve\")",
            )
        );
    }

    #[test]
    fn arity_seven_is_supported() {
        let ml = <(i64, i64, i64, i64, i64, i64, i64)>::ml_type();
        assert_eq!(ml, "int * int * int * int * int * int * int");
    }
}
