//! Forwarding pipeline.
//!
//! Every source message flows through:
//! 1. `Poller::fetch_channel()`: paged fetch past the channel position
//! 2. `FilterEngine::evaluate()`: keyword, sender and type rules
//! 3. `Formatter::format()`: decorate, escape and split into units
//! 4. `Dispatcher::deliver()`: paced sends, retries, cursor advance

pub mod dispatcher;
pub mod filter;
pub mod format;
pub mod markup;
pub mod poller;
pub mod types;
