//! API key pool for the rotating chat proxy
//!
//! Holds a fixed set of upstream API keys and decides which one each outbound
//! request uses. Keys that the upstream rate-limits are reported back and sit
//! out a cooldown; when every key is cooling down the pool force-evicts the
//! oldest cooldown so a request is never left without a key.
//!
//! Key lifecycle:
//! 1. Keys load from configuration at startup, all `Eligible`
//! 2. `acquire` scans round-robin from the cursor for an eligible key
//! 3. Upstream answers 429 → `report_limited` puts the key in `CoolingDown`
//!    and moves the cursor on
//! 4. Cooldown elapses → the key is eligible again at the next scan
//! 5. Nothing eligible → forced eviction hands out the earliest-limited key

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{UpstreamOutcome, classify_status, is_rate_limit_message};
pub use error::{Error, Result};
pub use pool::{DEFAULT_COOLDOWN, KeyPool, KeyStatus, SelectedKey, mask_key};
