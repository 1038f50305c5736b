// Copyright 2018-2025 the Deno authors. MIT license.

#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![deny(clippy::unused_async)]

//! Resolution, loading, linking and evaluation of ECMAScript module graphs.
//!
//! The engine that compiles and runs module bodies is supplied through the
//! [`modules::Evaluator`] trait, and module sources through
//! [`modules::ResourceLoader`].

pub mod builtins;
pub mod errors;
pub mod loader;
pub mod modules;
pub mod options;
pub mod resolver;
pub mod specifier;

pub use builtins::BuiltinModules;
pub use errors::ErrorCode;
pub use errors::ModuleError;
pub use loader::EsmLoader;
pub use modules::ModuleNamespace;
pub use options::LoaderOptions;
pub use specifier::ModuleIdentity;
