// Appliance records, keys and status conditions
pub mod appliance;

// Transport topic layout
pub mod topic;

// Publish/subscribe transports (MQTT, NATS JetStream, loopback)
pub mod transport;

// Declarative appliance store
pub mod store;

// Store persistence
pub mod snapshot;

// Inbound reports to reconcile triggers
pub mod bridge;

// Desired-state publishing
pub mod reconciler;

// Work queue and workers driving the reconciler
pub mod controller;

// HTTP API
pub mod api;

// Configuration
pub mod config;

// Startup wiring
pub mod operator;
