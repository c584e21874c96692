//! Ordered registry of test cases

use thiserror::Error;

use super::TestFn;

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Test {0} is already registered")]
    Duplicate(String),

    #[error("Unknown test suite: {0}")]
    UnknownSuite(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A named test
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub run: TestFn,
}

/// Test cases in registration order, which is also execution order
#[derive(Clone, Default)]
pub struct TestRegistry {
    cases: Vec<TestCase>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, run: TestFn) -> RegistryResult<()> {
        let name = name.into();
        if self.cases.iter().any(|case| case.name == name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!("Registered test {}", name);
        self.cases.push(TestCase { name, run });
        Ok(())
    }

    /// Keep only the tests whose name contains `pattern`
    pub fn filter(&mut self, pattern: &str) {
        self.cases.retain(|case| case.name.contains(pattern));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|case| case.name.as_str())
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
