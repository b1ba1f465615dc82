//! Detection, validation, and execution of triangular arbitrage.

pub mod detector;
pub mod executor;
pub mod validator;

pub use detector::{Detector, Leg, Opportunity};
pub use executor::{Executor, Trade, TradeState, TradeStep};
pub use validator::{Advice, AdvisoryScorer, Assessment, Validator};
