//! Spyglass Core - the traffic-rule boundary.
//!
//! This crate defines the capability interface the proxy pipeline consults
//! for every request, together with the plain data types that cross that
//! boundary. It deliberately contains no I/O: rule implementations live in
//! collaborating crates (a scripting layer, a GUI, test doubles) and are
//! handed to the proxy as `Arc<dyn TrafficRule>`.

mod rule;

pub use rule::{
    MockResponse, PassthroughRule, RequestRewrite, RequestSummary, RuleVerdict, TrafficRule,
};
