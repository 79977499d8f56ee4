//! Remote Runner - drive a test run inside a remote runtime
//!
//! A session endpoint owns a test framework and runs it whenever the
//! controller asks, streaming every lifecycle event back over a WebSocket.
//! Event arguments are cyclic descriptor graphs; the codec carries them
//! across losslessly.

pub mod cli;
pub mod codec;
pub mod commands;
pub mod common;
pub mod controller;
pub mod endpoint;
pub mod framework;
pub mod protocol;

// Re-export commonly used types for tests
pub use codec::{Arg, DecodedEvent, ErrorInfo, Graph, NodeId, Value};
pub use common::{Error, Result};
pub use controller::{ConnectionId, Controller, ControllerEvent, RunSummary};
pub use endpoint::{Callbacks, Client, ClientConfig, ConnectionStatus, RunHandle, RunState};
pub use framework::{EventName, FrameworkFactory, Runner, RunnerEvent, TestFramework};
pub use protocol::CloseInfo;
