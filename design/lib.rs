#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod assemble;
pub mod contrast;
pub mod covariates;
pub mod matching;
pub mod matrix;

#[path = "../pipeline/mod.rs"]
pub mod pipeline;
