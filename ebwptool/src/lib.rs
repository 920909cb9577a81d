extern crate clap;
extern crate ebwp;
extern crate rpassword;
#[macro_use]
extern crate serde_derive;

pub mod cli;
pub mod create;
pub mod error;
pub mod inspect;
pub mod restore;
pub mod utils;
