pub mod mcp;
pub mod tunnel;
