#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod log;
pub mod settings;
pub mod type_name;
pub mod types;
pub mod symbols;
pub mod module_interface;
pub mod module_registry;
pub mod resolver;
pub mod memory;
pub mod expr;
pub mod pretty;
pub mod interp;
pub mod evaluator;
pub mod context;

#[cfg(test)]
pub mod test_util;
