// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// Crate root.

// <>

//! Rule engine core for STARK
//!
//! Create an [`Env`], register native functions and classes, then
//! evaluate expressions, send messages to instances, or load a binary
//! image of saved constructs

pub mod sage;

pub use sage::{Env, SageConfig, Value};
