#[macro_use] extern crate log;
extern crate yaml_rust;

pub mod accdata;
pub mod accserver;
pub mod config;
