//! Core engine for the xcgi script server.
//!
//! This crate provides:
//! - Root registry: site directories resolved by host and URL prefix
//! - REST decomposition of paths into resource/id pairs and script choice
//! - Environment construction for script processes
//! - Admission-controlled script execution with process-group cleanup
//! - Per-root notify/wait bus for long-polling

pub mod bus;
pub mod env;
pub mod error;
pub mod execute;
pub mod rest;
pub mod root;

pub use bus::{Gate, NotifyBus, Subscription};
pub use env::{EnvBuilder, Environment, Fields, RequestMeta};
pub use error::{Error, Result};
pub use execute::{
    Admission, AdmissionPermit, ExecutionRequest, Executor, ProcessGroups, ScriptOutput,
};
pub use rest::{PathObject, ScriptKind, ScriptLocation};
pub use root::{Root, RootRegistry};
