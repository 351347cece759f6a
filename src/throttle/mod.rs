//! Rate-limit gating and retry policy for search calls.

pub mod budget;
pub mod pool;
pub mod retry;

pub use budget::{Credential, RateBudget};
pub use pool::{BudgetStatus, CredentialLease, CredentialPool};
pub use retry::RetryPolicy;
