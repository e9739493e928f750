//! Tool implementations for Tilt.
//!
//! Three tools are provider-defined (their schemas are built into the model
//! API and selected by [`ToolVersion`](tilt_core::ToolVersion)): the desktop
//! `computer`, the file editor and `bash`. The rest are custom tools with
//! JSON schemas: browser inspection over the DevTools protocol, task
//! reporting, read-only SQLite queries and JSON assertions.
//!
//! [`build_collection`] assembles the tool set for one loop invocation.

pub mod assert;
pub mod bash;
pub mod cdp;
pub mod computer;
pub mod edit;
pub mod groups;
pub mod inspect_js;
pub mod inspect_network;
pub mod sqlite_query;
pub mod task_reporter;

pub use assert::AssertTool;
pub use bash::BashTool;
pub use computer::{ComputerTool, ComputerVersion};
pub use edit::{EditTool, EditVersion};
pub use groups::{ToolContext, build_collection, tool_names};
pub use inspect_js::InspectJsTool;
pub use inspect_network::InspectNetworkTool;
pub use sqlite_query::SqliteQueryTool;
pub use task_reporter::TaskReporterTool;
