pub mod acme;
pub mod challenge;
pub mod codec;
pub mod dns_providers;
pub mod renewer;
