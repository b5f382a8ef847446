//! Execution-engine channel: wire protocol, transport links, typed client.

pub mod client;
pub mod link;
pub mod paper;
pub mod protocol;

pub use client::{round_to_venue_precision, CloseOutcome, ExecutionClient, OrderAck, PlaceOrder};
pub use link::{EngineLink, WsEngineLink};
pub use paper::{PaperEngineConfig, PaperEngineLink};
pub use protocol::{
    parse_inbound, verify_op_contract, CommandEnvelope, EngineEvent, EngineOp, OrderStatus,
    OrderUpdate, TradeExecution, SCHEMA_VERSION,
};
