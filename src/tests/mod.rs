//! Cross-module lifecycle suites: webhook intake through worker
//! execution, exercised against the in-memory backends and a stub
//! runner subprocess.

#[cfg(test)]
mod test_helpers;

#[cfg(test)]
mod pipeline_tests;
