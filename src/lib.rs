pub mod config;
pub mod database_ops;
pub mod logging;
pub mod normalization;
pub mod pipeline;
pub mod swapi;

pub mod util {
    pub mod db;
    pub mod env;
}

#[cfg(test)]
mod testing;
