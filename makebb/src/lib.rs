// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::emit::Layout;
pub use self::env::Env;
pub use self::names::Names;
pub use self::program::Program;

pub mod builder;
pub mod emit;
pub mod env;
pub mod modules;
pub mod names;
pub mod program;
pub mod resolve;
pub mod rewrite;
