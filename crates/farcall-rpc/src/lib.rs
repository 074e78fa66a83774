//! Demo service shared by the `farcall-rpc` binary and its tests.

pub mod calculator;

pub use calculator::{Calculator, CalculatorAdapter, CalculatorProxy};
