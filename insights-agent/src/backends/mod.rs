// ABOUTME: Backend implementations - one module per agent family plus its event mapper.
// ABOUTME: Each backend implements AgentBackend and hands out AgentSession objects.

pub mod acp;
pub mod acp_events;
pub mod app_server;
pub mod app_server_events;
pub mod cli;
pub mod cli_events;
pub mod mock;
