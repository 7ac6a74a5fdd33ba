mod service;
pub use service::*;

mod signer;
pub use signer::*;

mod token_issuer;
pub use token_issuer::*;

mod rotation;
pub use rotation::*;

mod access_service_impl;
pub use access_service_impl::*;
