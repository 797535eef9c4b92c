//! Inbound listeners

mod mixed;
mod stream;

pub use mixed::MixedInbound;
pub use stream::PrefetchStream;
