//! Per-credential monthly quota accounting and credential selection.

mod allocator;
mod fallback;
mod period;
mod strategy;

pub use allocator::{AllocatedCredential, CredentialStatus, CredentialSummary, QuotaAllocator};
pub use fallback::{detect_with_fallback, FallbackContext, MAX_CREDENTIAL_ATTEMPTS};
pub use period::PeriodClock;
pub use strategy::{select, KeySelectionStrategy, RoundRobinCursor};
