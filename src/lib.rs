//! Process-level dynamic binary instrumentation core: decode/encode one
//! instruction stream, build instrumented fragments into a software code
//! cache, dispatch control through it, and keep it consistent across
//! signals, threads, fork, and attach/detach.
//!
//! `log` is declared first (and `#[macro_use]`d) so every other module can
//! call the bare `log!`/`ed_assert!` macros it exports without an explicit
//! `crate::log::` path.

#[macro_use]
pub mod log;

pub mod error;
pub mod config;
pub mod arch;
pub mod bindings;
pub mod registers;
pub mod ir;
pub mod decoder;
pub mod encoder;
pub mod module_map;
pub mod fragment;
pub mod fragment_builder;
pub mod code_cache;
pub mod dispatcher;
pub mod context_switch;
pub mod restart_region;
pub mod signal;
pub mod thread_registry;
pub mod consistency;
pub mod startup;
pub mod syscalls;
pub mod persist;
pub mod client_api;
pub mod commands;
