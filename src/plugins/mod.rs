//! The compiled-in tamper plugins.

mod bad_network;
mod disconnection;
mod interceptor;
mod no_compression;

pub use bad_network::BadNetworkPlugin;
pub use disconnection::DisconnectionPlugin;
pub use interceptor::InterceptorPlugin;
pub use no_compression::NoCompressionPlugin;
