pub mod action_log;
pub mod agent_config;
pub mod email_log;
pub mod email_queue;
pub mod lead;
pub mod reply;
