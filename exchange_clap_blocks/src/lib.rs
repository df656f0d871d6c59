//! Building blocks for [`clap`]-driven configuration of the exchange components.
pub mod partition_request;
