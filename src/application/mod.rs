//! Application layer containing the ledger's business logic.
//!
//! [`ledger::MutationService`] is the single chokepoint that touches balances and
//! transaction status. User requests ([`payments`]), provider callbacks
//! ([`webhook`]) and the periodic [`sweeper`] all funnel through it, and talk to the
//! outside world only through the ports in [`crate::domain::ports`].

pub mod ledger;
pub mod limits;
pub mod payments;
pub mod refund;
pub mod sweeper;
pub mod webhook;
