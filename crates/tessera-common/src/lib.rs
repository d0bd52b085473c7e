//! Tessera Common Library
//!
//! Shared types for the gateway and its clients: the error taxonomy, the
//! connection descriptor grammar, the request/response documents and the
//! length-prefixed frame codec.

pub mod client;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use client::GatewayClient;
pub use codec::{FrameCodec, ProtocolSettings};
pub use descriptor::ConnectionDescriptor;
pub use error::{Result, TesseraError};
pub use protocol::{
    ColumnDef, ColumnType, Command, CommandResult, ExecutionOptions, ResultKind, ResultMode, Row,
    Rowset, Value,
};
