pub mod audit;
pub mod cluster;
pub mod entity;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod guards;
pub mod lock;
pub mod paths;
pub mod policy;
pub mod rounds;
pub mod snapshot;
pub mod state_machine;
pub mod time;
pub mod verifier;
