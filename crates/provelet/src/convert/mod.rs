//! Converter framework: mapping driver types onto engine-side shapes.
//!
//! Every participating driver type carries four engine-code constants and
//! two transfer operations. The code fragments are referentially
//! transparent engine expressions — they capture no mutable engine state —
//! and are composed textually when converters nest. Converter-internal
//! functions are compiled once per session through the session's code-keyed
//! cache.
//!
//! Engine-side shapes build on the universal exception carriers declared by
//! [`ENGINE_BOOTSTRAP`]: primitives wrap into `E_Int`/`E_String`/`E_Bool`,
//! tuples into right-nested `E_Pair`, lists into `E_List`, options into
//! `E_Option`. On the wire, composites travel as `DList`s of `DObject`
//! references so that element traffic can proceed concurrently.

mod tuples;

use async_trait::async_trait;

use crate::bridge::protocol::Data;
use crate::error::BridgeError;
use crate::handle::Handle;
use crate::session::Session;

/// Carrier declarations the converter framework assumes. Issued by the
/// session exactly once, before any converter-generated code runs, so the
/// engine never sees a double declaration.
pub const ENGINE_BOOTSTRAP: &str = "exception E_Function of data -> data; \
     exception E_List of exn list; \
     exception E_Bool of bool; \
     exception E_Option of exn option; \
     exception E_Int of int; \
     exception E_String of string; \
     exception E_Pair of exn * exn";

/// Associates a driver-side type with engine-side code and data-shape
/// expectations.
///
/// The phantom parameter of a [`Handle`] is advisory; this trait is where
/// the shapes are actually enforced. `store` and `retrieve` are inverses up
/// to engine evaluation: `retrieve(store(v)).await == v` for every value of
/// a converter's type.
#[async_trait]
pub trait Converter: Sized + Send + Sync + 'static {
    /// Engine-side type name, for diagnostics and generated code labels.
    fn ml_type() -> String;

    /// Engine expression for a function wrapping an unwrapped engine value
    /// into the universal exception carrier.
    fn value_to_exn() -> String;

    /// Engine expression for the inverse projection; raises when the
    /// carrier does not hold this shape.
    fn exn_to_value() -> String;

    /// Encode `value` into the store and return a typed handle.
    async fn store(session: &Session, value: Self) -> Result<Handle<Self>, BridgeError>;

    /// Decode the stored object back into a driver value.
    async fn retrieve(handle: &Handle<Self>) -> Result<Self, BridgeError>;
}

impl Session {
    /// Store a driver value engine-side via its [`Converter`].
    pub async fn store<A: Converter>(&self, value: A) -> Result<Handle<A>, BridgeError> {
        A::store(self, value).await
    }
}

// ============================================================================
// Code-generation helpers
// ============================================================================

/// Build `fn pat1 => body1 | ... | _ => raise Fail "label"`.
///
/// Generated matches always end in a raising fallback arm naming the
/// function, so engine-side match failures surface with a useful message
/// instead of a bare match exception.
pub(crate) fn match_fn(label: &str, arms: &[(String, String)]) -> String {
    let mut out = String::from("fn ");
    for (pat, body) in arms {
        out.push_str(pat);
        out.push_str(" => ");
        out.push_str(body);
        out.push_str(" | ");
    }
    out.push_str(&format!("_ => raise Fail \"{label}\""));
    out
}

/// Wrap a data-to-data match into the function carrier.
pub(crate) fn data_fn(label: &str, arms: &[(String, String)]) -> String {
    format!("E_Function ({})", match_fn(label, arms))
}

fn shape_error(expected: &str, got: &Data) -> BridgeError {
    BridgeError::Convert(format!("expected {expected}, got {got:?}"))
}

/// Interpret a composite element slot as an object reference.
pub(crate) fn element_handle<A: Converter>(
    session: &Session,
    data: Data,
) -> Result<Handle<A>, BridgeError> {
    match data {
        // The engine stored this element while encoding the reply; the
        // converter protocol guarantees its shape.
        Data::Object(id) => Ok(unsafe { Handle::from_raw_parts(session, id) }),
        other => Err(shape_error("an object reference", &other)),
    }
}

/// Apply a cached single-step store function to a primitive payload.
async fn store_primitive<A>(
    session: &Session,
    fn_code: &str,
    payload: Data,
) -> Result<Handle<A>, BridgeError> {
    let function = session.compiled_fn(fn_code).await?;
    let pending = session.submit_apply(function, payload, Vec::new()).await;
    Ok(Handle::from_pending(session.clone(), pending))
}

/// Apply a cached projection function to a handle's object reference.
async fn retrieve_raw<A>(handle: &Handle<A>, fn_code: &str) -> Result<Data, BridgeError> {
    let session = handle.session();
    let function = session.compiled_fn(fn_code).await?;
    let id = handle.id().await?;
    session
        .apply_data(function, Data::Object(id), vec![handle.guard()])
        .await
}

// ============================================================================
// Primitive converters
// ============================================================================

const STORE_INT: &str = r#"E_Function (fn DInt i => DObject (E_Int i) | _ => raise Fail "int.store")"#;
const RETRIEVE_INT: &str =
    r#"E_Function (fn DObject (E_Int i) => DInt i | _ => raise Fail "int.retrieve")"#;

#[async_trait]
impl Converter for i64 {
    fn ml_type() -> String {
        "int".to_string()
    }

    fn value_to_exn() -> String {
        "E_Int".to_string()
    }

    fn exn_to_value() -> String {
        r#"fn E_Int i => i | _ => raise Fail "int.exn_to_value""#.to_string()
    }

    async fn store(session: &Session, value: i64) -> Result<Handle<i64>, BridgeError> {
        store_primitive(session, STORE_INT, Data::Int(value)).await
    }

    async fn retrieve(handle: &Handle<i64>) -> Result<i64, BridgeError> {
        match retrieve_raw(handle, RETRIEVE_INT).await? {
            Data::Int(value) => Ok(value),
            other => Err(shape_error("an int", &other)),
        }
    }
}

/// `i32` shares the engine `int` type and the 64-bit wire width. Values
/// that do not fit on retrieval fail instead of truncating.
#[async_trait]
impl Converter for i32 {
    fn ml_type() -> String {
        "int".to_string()
    }

    fn value_to_exn() -> String {
        i64::value_to_exn()
    }

    fn exn_to_value() -> String {
        i64::exn_to_value()
    }

    async fn store(session: &Session, value: i32) -> Result<Handle<i32>, BridgeError> {
        store_primitive(session, STORE_INT, Data::Int(i64::from(value))).await
    }

    async fn retrieve(handle: &Handle<i32>) -> Result<i32, BridgeError> {
        match retrieve_raw(handle, RETRIEVE_INT).await? {
            Data::Int(value) => i32::try_from(value).map_err(|_| {
                BridgeError::Convert(format!("value {value} does not fit in 32 bits"))
            }),
            other => Err(shape_error("an int", &other)),
        }
    }
}

const STORE_BOOL: &str = r#"E_Function (fn DInt 0 => DObject (E_Bool false) | DInt _ => DObject (E_Bool true) | _ => raise Fail "bool.store")"#;
const RETRIEVE_BOOL: &str = r#"E_Function (fn DObject (E_Bool true) => DInt 1 | DObject (E_Bool false) => DInt 0 | _ => raise Fail "bool.retrieve")"#;

#[async_trait]
impl Converter for bool {
    fn ml_type() -> String {
        "bool".to_string()
    }

    fn value_to_exn() -> String {
        "E_Bool".to_string()
    }

    fn exn_to_value() -> String {
        r#"fn E_Bool b => b | _ => raise Fail "bool.exn_to_value""#.to_string()
    }

    async fn store(session: &Session, value: bool) -> Result<Handle<bool>, BridgeError> {
        store_primitive(session, STORE_BOOL, Data::Int(i64::from(value))).await
    }

    async fn retrieve(handle: &Handle<bool>) -> Result<bool, BridgeError> {
        match retrieve_raw(handle, RETRIEVE_BOOL).await? {
            Data::Int(0) => Ok(false),
            Data::Int(1) => Ok(true),
            other => Err(shape_error("a bool as 0 or 1", &other)),
        }
    }
}

const STORE_STRING: &str = r#"E_Function (fn DString s => DObject (E_String s) | _ => raise Fail "string.store")"#;
const RETRIEVE_STRING: &str =
    r#"E_Function (fn DObject (E_String s) => DString s | _ => raise Fail "string.retrieve")"#;

#[async_trait]
impl Converter for String {
    fn ml_type() -> String {
        "string".to_string()
    }

    fn value_to_exn() -> String {
        "E_String".to_string()
    }

    fn exn_to_value() -> String {
        r#"fn E_String s => s | _ => raise Fail "string.exn_to_value""#.to_string()
    }

    async fn store(session: &Session, value: String) -> Result<Handle<String>, BridgeError> {
        store_primitive(session, STORE_STRING, Data::String(value)).await
    }

    async fn retrieve(handle: &Handle<String>) -> Result<String, BridgeError> {
        match retrieve_raw(handle, RETRIEVE_STRING).await? {
            Data::String(text) => Ok(text),
            other => Err(shape_error("a string", &other)),
        }
    }
}

const STORE_UNIT: &str = r#"E_Function (fn _ => DObject (E_List []))"#;
const RETRIEVE_UNIT: &str = r#"E_Function (fn _ => DList [])"#;

#[async_trait]
impl Converter for () {
    fn ml_type() -> String {
        "unit".to_string()
    }

    fn value_to_exn() -> String {
        "fn _ => E_List []".to_string()
    }

    fn exn_to_value() -> String {
        "fn _ => ()".to_string()
    }

    async fn store(session: &Session, _value: ()) -> Result<Handle<()>, BridgeError> {
        store_primitive(session, STORE_UNIT, Data::List(Vec::new())).await
    }

    async fn retrieve(handle: &Handle<()>) -> Result<(), BridgeError> {
        match retrieve_raw(handle, RETRIEVE_UNIT).await? {
            Data::List(_) => Ok(()),
            other => Err(shape_error("a unit marker", &other)),
        }
    }
}

// ============================================================================
// Composite converters: list, option
// ============================================================================

const STORE_LIST: &str = r#"E_Function (fn DList ds => DObject (E_List (map (fn DObject e => e | _ => raise Fail "list.store") ds)) | _ => raise Fail "list.store")"#;
const RETRIEVE_LIST: &str = r#"E_Function (fn DObject (E_List xs) => DList (map DObject xs) | _ => raise Fail "list.retrieve")"#;

#[async_trait]
impl<A: Converter> Converter for Vec<A> {
    fn ml_type() -> String {
        format!("{} list", A::ml_type())
    }

    fn value_to_exn() -> String {
        format!("fn xs => E_List (map ({}) xs)", A::value_to_exn())
    }

    fn exn_to_value() -> String {
        match_fn(
            "list.exn_to_value",
            &[(
                "E_List xs".to_string(),
                format!("map ({}) xs", A::exn_to_value()),
            )],
        )
    }

    async fn store(session: &Session, value: Vec<A>) -> Result<Handle<Vec<A>>, BridgeError> {
        let handles =
            futures::future::try_join_all(value.into_iter().map(|item| A::store(session, item)))
                .await?;
        let ids = futures::future::try_join_all(handles.iter().map(|handle| handle.id())).await?;
        let function = session.compiled_fn(STORE_LIST).await?;
        let items = ids.into_iter().map(Data::Object).collect();
        let guards = handles.iter().map(|handle| handle.guard()).collect();
        let pending = session.submit_apply(function, Data::List(items), guards).await;
        Ok(Handle::from_pending(session.clone(), pending))
    }

    async fn retrieve(handle: &Handle<Vec<A>>) -> Result<Vec<A>, BridgeError> {
        let items = match retrieve_raw(handle, RETRIEVE_LIST).await? {
            Data::List(items) => items,
            other => return Err(shape_error("a list of object references", &other)),
        };
        let session = handle.session();
        let elements = items
            .into_iter()
            .map(|item| element_handle::<A>(session, item))
            .collect::<Result<Vec<_>, _>>()?;
        futures::future::try_join_all(elements.iter().map(|element| A::retrieve(element))).await
    }
}

const STORE_OPTION: &str = r#"E_Function (fn DList [] => DObject (E_Option NONE) | DList [DObject e] => DObject (E_Option (SOME e)) | _ => raise Fail "option.store")"#;
const RETRIEVE_OPTION: &str = r#"E_Function (fn DObject (E_Option NONE) => DList [] | DObject (E_Option (SOME e)) => DList [DObject e] | _ => raise Fail "option.retrieve")"#;

#[async_trait]
impl<A: Converter> Converter for Option<A> {
    fn ml_type() -> String {
        format!("{} option", A::ml_type())
    }

    fn value_to_exn() -> String {
        match_fn(
            "option.value_to_exn",
            &[
                ("NONE".to_string(), "E_Option NONE".to_string()),
                (
                    "SOME x".to_string(),
                    format!("E_Option (SOME (({}) x))", A::value_to_exn()),
                ),
            ],
        )
    }

    fn exn_to_value() -> String {
        match_fn(
            "option.exn_to_value",
            &[
                ("E_Option NONE".to_string(), "NONE".to_string()),
                (
                    "E_Option (SOME e)".to_string(),
                    format!("SOME (({}) e)", A::exn_to_value()),
                ),
            ],
        )
    }

    async fn store(session: &Session, value: Option<A>) -> Result<Handle<Option<A>>, BridgeError> {
        let (payload, guards) = match value {
            None => (Data::List(Vec::new()), Vec::new()),
            Some(inner) => {
                let element = A::store(session, inner).await?;
                let payload = Data::List(vec![Data::Object(element.id().await?)]);
                (payload, vec![element.guard()])
            }
        };
        let function = session.compiled_fn(STORE_OPTION).await?;
        let pending = session.submit_apply(function, payload, guards).await;
        Ok(Handle::from_pending(session.clone(), pending))
    }

    async fn retrieve(handle: &Handle<Option<A>>) -> Result<Option<A>, BridgeError> {
        let mut items = match retrieve_raw(handle, RETRIEVE_OPTION).await? {
            Data::List(items) => items,
            other => return Err(shape_error("an option encoding", &other)),
        };
        match items.len() {
            0 => Ok(None),
            1 => {
                let element = element_handle::<A>(handle.session(), items.remove(0))?;
                Ok(Some(A::retrieve(&element).await?))
            }
            n => Err(BridgeError::Convert(format!(
                "option encoding with {n} elements"
            ))),
        }
    }
}

// ============================================================================
// Handle identity converter
// ============================================================================

/// A handle is itself a valid driver-side value: storing or retrieving it
/// is the identity and performs no engine round trip. The result shares id
/// state with the input, so disposal still happens exactly once.
#[async_trait]
impl<A: Converter> Converter for Handle<A> {
    fn ml_type() -> String {
        A::ml_type()
    }

    fn value_to_exn() -> String {
        "fn x => x".to_string()
    }

    fn exn_to_value() -> String {
        "fn x => x".to_string()
    }

    async fn store(
        _session: &Session,
        value: Handle<A>,
    ) -> Result<Handle<Handle<A>>, BridgeError> {
        Ok(value.retype())
    }

    async fn retrieve(handle: &Handle<Handle<A>>) -> Result<Handle<A>, BridgeError> {
        Ok(handle.retype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_fragments() {
        assert_eq!(i64::ml_type(), "int");
        assert_eq!(i64::value_to_exn(), "E_Int");
        assert_eq!(
            i64::exn_to_value(),
            r#"fn E_Int i => i | _ => raise Fail "int.exn_to_value""#
        );
        assert_eq!(bool::value_to_exn(), "E_Bool");
        assert_eq!(<()>::ml_type(), "unit");
    }

    #[test]
    fn i32_shares_the_engine_int_type() {
        assert_eq!(i32::ml_type(), i64::ml_type());
        assert_eq!(i32::value_to_exn(), i64::value_to_exn());
    }

    #[test]
    fn list_fragments_compose_textually() {
        assert_eq!(Vec::<i64>::ml_type(), "int list");
        assert_eq!(
            Vec::<i64>::value_to_exn(),
            "fn xs => E_List (map (E_Int) xs)"
        );
    }

    #[test]
    fn option_fragments_compose_textually() {
        assert_eq!(Option::<String>::ml_type(), "string option");
        let expected = concat!(
            "fn NONE => E_Option NONE | SOME x => E_Option (SOME ((E_String) x))",
            " | _ => raise Fail \"option.value_to_exn\"",
        );
        assert_eq!(Option::<String>::value_to_exn(), expected);
    }

    #[test]
    fn match_fn_appends_raising_fallback() {
        let code = match_fn(
            "demo",
            &[("DInt i".to_string(), "DObject (E_Int i)".to_string())],
        );
        assert_eq!(
            code,
            r#"fn DInt i => DObject (E_Int i) | _ => raise Fail "demo""#
        );
    }

    #[test]
    fn handle_converter_is_identity() {
        assert_eq!(Handle::<i64>::ml_type(), "int");
        assert_eq!(Handle::<i64>::value_to_exn(), "fn x => x");
    }
}
