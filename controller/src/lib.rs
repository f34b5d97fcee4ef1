pub mod analysis;
pub mod builder;
pub mod clock;
pub mod error;
pub mod integration;
pub mod transform;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
