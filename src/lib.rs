//! Settlement pipeline of an Airnode oracle node.
//!
//! Takes decoded on-chain request events and off-chain API results and turns
//! them into verified, deduplicated, nonce-ordered fulfillment transactions,
//! one sponsor wallet at a time. The chain is the only system of record: a
//! request that is not settled in one run is rediscovered on the next.
//!
//! Stages, in pipeline order:
//! - [`aggregation`]: one call per request id, template parameters merged in
//! - [`verification`]: request/template ids and sponsor wallets recomputed
//! - [`authorization`]: external authorizer decisions applied
//! - [`grouping`]: partition by sponsor, order by emission
//! - [`nonces`]: per-sponsor nonce assignment
//! - [`submission`]: sequential signing and broadcast per sponsor
//!
//! [`coordinator::run`] drives one cycle over every configured provider.

pub mod aggregation;
pub mod authorization;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod external;
pub mod gas;
pub mod grouping;
pub mod logging;
pub mod nonces;
pub mod parameters;
pub mod signing;
pub mod state;
pub mod submission;
pub mod types;
pub mod verification;
pub mod wallet;
