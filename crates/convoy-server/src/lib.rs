//! Process wiring for the Convoy control core.

pub mod codec;
pub mod cron;
pub mod git;
pub mod shutdown;

pub use codec::AesEnvelopeCodec;
pub use cron::run_cron_ticker;
pub use git::{StaticTokenProvider, resolver_from_config};
pub use shutdown::shutdown_signal;
