//! Baton - conductor runtime for serverless compositions
//!
//! A composition describes how external actions combine (sequence, if,
//! while, try/finally, parallel, map, async, dynamic). Baton compiles the
//! composition AST into a flat FSM and drives it in continuation-passing
//! style: every activation advances the machine until it finishes, needs
//! an external action (returning a continuation the platform re-enters),
//! or forks branches that rendezvous through an external store.
//!
//! ## Core
//!
//! - [`compiler`]: AST to FSM lowering, one rule per combinator
//! - [`interpreter`]: the step loop, error inspection, and unwinding
//! - [`barrier`]: fork/join across independent activations
//!
//! ## Platform seams
//!
//! - [`ActionInvoker`]: fires actions, including the conductor itself
//! - [`BarrierStore`]: the list protocol the barrier needs from a store
//! - [`LocalPlatform`]: in-process implementations of both, for tests

pub mod ast;
pub mod barrier;
pub mod compiler;
pub mod conductor;
pub mod config;
pub mod continuation;
pub mod env;
pub mod evaluator;
pub mod fsm;
pub mod interpreter;
pub mod invoker;
pub mod lexer;
pub mod local;
pub mod manifest;
pub mod parser;
pub mod store;

// Composition model
pub use ast::{AstKind, AstNode, FunctionExec};
pub use compiler::{compile, CompileError};
pub use fsm::{Op, State};

// Execution model
pub use conductor::Conductor;
pub use continuation::{Continuation, Execution, Frame, JoinSpec, COMPOSER_KEY};
pub use interpreter::{inspect, ConductorError, Outcome};

// Platform seams
pub use invoker::{ActionInvoker, Activation, InvokeError};
pub use store::{
    BarrierStore, MemoryConnector, MemoryStore, StoreConfig, StoreConnector, StoreError,
};

// Configuration and packaging
pub use config::{Config, DEFAULT_HEARTBEAT_ACTION};
pub use manifest::{action_descriptor, DescriptorOptions, CONDUCTOR_VERSION};

// Inline function language
pub use evaluator::{is_truthy, run_source, EvalError, EvalValue, Scope};

// Local platform
pub use local::{action, ActionCallable, LocalOptions, LocalPlatform, LOCAL_ACTION_NAME};
