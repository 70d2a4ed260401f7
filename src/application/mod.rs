pub mod accounts;
pub mod analysis;
pub mod billing;
pub mod entitlement;

pub use accounts::*;
pub use analysis::*;
pub use billing::*;
pub use entitlement::*;
