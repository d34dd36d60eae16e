//! Scenario tests for mywire, run against an in-process mock server
pub mod mock;

#[cfg(test)]
mod test;
