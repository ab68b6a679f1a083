// Copyright 2024 Cornell University
// released under MIT License

pub mod assemble;
pub mod blocks;
pub mod config;
pub mod diagnostic;
pub mod errors;
pub mod hp;
pub mod ir;
pub mod kind;
pub mod macros;
pub mod order;
pub mod parser;
pub mod serialize;
pub mod synth;
pub mod term;
