pub mod capture;
pub mod config;
pub mod dom;
pub mod driver;
pub mod error;
pub mod hands;
pub mod interpreter;
pub mod observer;
pub mod session;
pub mod types;
pub mod wait;

#[cfg(test)]
mod testing;

pub use config::OracleConfig;
pub use error::{OracleError, Result};
pub use session::{run, run_with_driver, validate};
pub use types::{OracleResult, Spec, Stage};

use serde_json::Value;
use std::io::BufReader;
use std::path::Path;

/// Read a spec document from disk without validating its shape.
pub fn load_spec(path: &Path) -> Result<Value> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let raw: Value = serde_json::from_reader(reader)?;
    Ok(raw)
}
