//! These models represent the objects passed around by the agent
//!
//! There are two external formats we need to interact with:
//! - bedrock converse messages/tools, sent from the agent to the model endpoint
//! - mcp tool listings and tool results, exchanged with the systems providing tools
//!
//! We always immediately convert those wire formats into the internal structs using
//! to/from helpers, so the agent loop never touches raw json beyond tool arguments
//! and tool schemas, which stay opaque.
pub mod content;
pub mod conversation;
pub mod message;
pub mod role;
pub mod tool;
