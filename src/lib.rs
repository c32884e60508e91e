// Copyright 2025 The regexweave contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # regexweave
//!
//! [![Crates.io](https://img.shields.io/crates/v/regexweave.svg)](https://crates.io/crates/regexweave)
//! [![Documentation](https://docs.rs/regexweave/badge.svg)](https://docs.rs/regexweave)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/regexweave/regexweave/blob/main/LICENSE)
//!
//! A build-time CIL transformer that finds `Regex` construction and static-call sites with
//! compile-time-constant arguments in a compiled .NET module, precompiles those patterns into a
//! side assembly, merges the generated types back into the module, and rewrites every site to go
//! through a cached singleton accessor. The per-call pattern parse disappears; each distinct
//! `(pattern, options)` pair is built exactly once per process.
//!
//! ## Pipeline
//!
//! [`weaver::ModuleWeaver::execute`] drives the whole transformation:
//!
//! 1. **Find** - [`extractor`] scans method bodies for the cataloged `Regex` call shapes
//!    ([`catalog`]) and uses the backward stack walk in [`locator`] to pin down which
//!    instructions produced the pattern and options arguments.
//! 2. **Compile** - [`compile`] deduplicates the discovered definitions, hashes the batch and
//!    hands it to a [`compile::RegexAssemblyCompiler`] backend, reusing a previous artifact
//!    when the embedded hash still matches.
//! 3. **Merge** - [`merge`] copies the compiled regex types out of the artifact into the
//!    target module, re-importing external references and preserving body layout.
//! 4. **Generate** - [`generator`] emits one lazily-initialized static accessor per compiled
//!    regex (plus a timeout-aware variant).
//! 5. **Rewrite** - [`rewriter`] deletes the constant argument producers and redirects each
//!    call site to the accessor.
//!
//! ## Quick Start
//!
//! ```rust
//! use regexweave::cil::{Module, Version};
//! use regexweave::extractor;
//!
//! let module = Module::new("Widgets", Version(1, 0, 0, 0));
//! for method in &module.methods {
//!     if let Some(body) = &method.body {
//!         for (_site, outcome) in extractor::scan(&module, body)? {
//!             println!("{outcome:?}");
//!         }
//!     }
//! }
//! # Ok::<(), regexweave::Error>(())
//! ```
//!
//! ## Design Notes
//!
//! The crate operates on an in-memory [`cil::Module`] model rather than raw metadata tables;
//! instructions carry stable [`cil::InstrId`]s so rewrites never invalidate branch targets.
//! Actual pattern compilation is behind the [`compile::RegexAssemblyCompiler`] trait so the
//! transformation logic stays testable without a .NET toolchain on the machine.

#[macro_use]
pub(crate) mod error;

pub mod catalog;
pub mod cil;
pub mod compile;
pub mod context;
pub mod extractor;
pub mod generator;
pub mod literal;
pub mod locator;
pub mod merge;
pub mod namespace;
pub mod options;
pub mod rewriter;
pub mod weaver;

pub use error::Error;

/// Convenience alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;
