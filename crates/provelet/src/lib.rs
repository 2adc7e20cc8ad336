//! provelet: typed asynchronous bridge between a driver process and an
//! ML-evaluating prover engine.
//!
//! The engine stores every value it evaluates under a monotonically
//! assigned id; the driver manipulates those values through phantom-typed
//! [`Handle`]s whose ids resolve asynchronously. [`Session`] multiplexes
//! requests over a pair of byte pipes, the [`Converter`] framework maps
//! driver types onto engine-side shapes, and [`Session::compile_function`]
//! turns engine-code strings into callable remote functions.
//!
//! The engine half of the protocol lives in [`engine`]: a single-threaded
//! dispatch loop generic over the actual evaluator. [`miniml::MiniMl`] is
//! an in-crate evaluator good enough to run everything the converter
//! framework emits, so a full driver/engine pair fits in one process:
//!
//! ```no_run
//! use provelet::{Session, miniml::MiniMl, run_engine};
//!
//! # async fn example() -> Result<(), provelet::BridgeError> {
//! let (driver_io, engine_io) = tokio::io::duplex(64 * 1024);
//! let (engine_read, engine_write) = tokio::io::split(engine_io);
//! tokio::spawn(run_engine(MiniMl::new(), engine_read, engine_write));
//!
//! let (read, write) = tokio::io::split(driver_io);
//! let session = Session::connect(read, write).await?;
//!
//! let square = session.compile_function::<i64, i64>("fn i => i * i").await;
//! assert_eq!(square.call(12).await?, 144);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod convert;
pub mod engine;
mod error;
pub mod function;
mod handle;
pub mod miniml;
mod session;

pub use bridge::protocol::{Data, ObjectId};
pub use convert::{Converter, ENGINE_BOOTSTRAP};
pub use engine::{
    EngineConfig, EngineData, EngineException, EngineRuntime, ObjectTable, run_engine,
    run_engine_with,
};
pub use error::BridgeError;
pub use function::{FunOf, MlFunction};
pub use handle::Handle;
pub use session::{Session, SessionConfig};
