pub mod ads;
pub mod downtime;
pub mod filter;
pub mod gossip;
pub mod health;
pub mod ioload;
pub mod metrics;
pub mod namespaces;
pub mod routes;
pub mod stat;
pub mod state;
pub mod steering;
pub mod token;
pub mod topology;
