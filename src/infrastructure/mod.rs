pub mod activity_store;
pub mod config;
pub mod error;
pub mod remote_document_client;
pub mod storage;
pub mod sync_state_repository;
